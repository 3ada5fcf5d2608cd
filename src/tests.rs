#[cfg(test)]
pub(crate) mod scenarios {
    use crate::err::{Error, Result};
    use crate::mm::{create, open, CreateOptions, OpenOptions};
    use crate::object::{PersistentClass, PersistentObject};
    use crate::value::Value;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn pool_file(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    // ----------------------------------------------------------------
    // the guessing game fixture, a record class with a list attribute

    struct Guesser;

    impl PersistentClass for Guesser {
        const NAME: &'static str = "guess.Guesser";

        fn init(obj: &PersistentObject, args: &[Value]) -> Result<()> {
            if args.len() != 3 {
                return Err(Error::InvalidArgument(format!(
                    "Guesser takes 3 arguments, {} given",
                    args.len()
                )));
            }
            obj.set_attr("name", args[0].clone())?;
            obj.set_attr("maximum", args[1].clone())?;
            obj.set_attr("number", args[2].clone())?;
            obj.set_attr("guesses", Value::List(obj.mm().new_list()?))?;
            obj.set_attr("lost", Value::Bool(false))?;
            obj.set_attr("done", Value::Bool(false))
        }
    }

    fn check_guess(g: &PersistentObject, guess: i64) -> Result<&'static str> {
        g.mm().transaction(|| {
            let number = g.get_attr("number")?.as_int().unwrap();
            let guesses = g.get_attr("guesses")?.as_list().unwrap().clone();
            let mut outcome = "";
            if guesses.contains(&Value::Int(guess))? {
                outcome = "SEEN";
            }
            guesses.append(Value::Int(guess))?;
            if guess == number {
                outcome = "EQUAL";
                g.set_attr("done", Value::Bool(true))?;
            }
            if guesses.len() > 6 {
                g.set_attr("lost", Value::Bool(true))?;
                g.set_attr("done", Value::Bool(true))?;
            }
            if guess < number {
                outcome = "LOW";
            }
            if guess > number {
                outcome = "HIGH";
            }
            Ok(outcome)
        })
    }

    // ----------------------------------------------------------------

    #[test]
    fn record_attribute_durability() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "record.pool");
        {
            let pool = create(&fname, CreateOptions::new().register::<Guesser>()).unwrap();
            let r = pool
                .new_object::<Guesser>(&[Value::from("Alice"), Value::Int(50), Value::Int(23)])
                .unwrap();
            r.set_attr("count", Value::Int(3)).unwrap();
            pool.set_root(Value::Object(r)).unwrap();
            pool.close().unwrap();
        }
        let pool = open(&fname, OpenOptions::new().register::<Guesser>()).unwrap();
        let r = pool.root().unwrap();
        let r = r.as_object().unwrap();
        assert_eq!(r.get_attr("name").unwrap(), Value::from("Alice"));
        assert_eq!(r.get_attr("count").unwrap(), Value::Int(3));
    }

    #[test]
    fn guessing_game_state_machine() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "guess.pool");
        {
            let pool = create(&fname, CreateOptions::new().register::<Guesser>()).unwrap();
            let g = pool
                .new_object::<Guesser>(&[Value::from("Bob"), Value::Int(50), Value::Int(23)])
                .unwrap();
            pool.set_root(Value::Object(g.clone())).unwrap();

            assert_eq!(check_guess(&g, 10).unwrap(), "LOW");
            assert_eq!(check_guess(&g, 30).unwrap(), "HIGH");
            pool.close().unwrap();
        }
        let pool = open(&fname, OpenOptions::new().register::<Guesser>()).unwrap();
        let g = pool.root().unwrap().as_object().unwrap().clone();
        assert_eq!(check_guess(&g, 20).unwrap(), "LOW");
        assert_eq!(check_guess(&g, 23).unwrap(), "EQUAL");

        assert_eq!(g.get_attr("done").unwrap(), Value::Bool(true));
        assert_eq!(g.get_attr("lost").unwrap(), Value::Bool(false));
        let guesses = g
            .get_attr("guesses")
            .unwrap()
            .as_list()
            .unwrap()
            .values()
            .unwrap();
        assert_eq!(
            guesses,
            vec![Value::Int(10), Value::Int(30), Value::Int(20), Value::Int(23)]
        );
    }

    #[test]
    fn dict_of_mixed_keys_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "mixed.pool");
        let data: Vec<(Value, Value)> = vec![
            (Value::from("a"), Value::Int(1)),
            (Value::Int(2), Value::Float(3.7)),
            (Value::Float(4.1), Value::Int(3)),
            (Value::from("something"), Value::from("somewhere")),
            (Value::from("főo"), Value::from("bàr")),
        ];
        {
            let pool = create(&fname, CreateOptions::new().debug(true)).unwrap();
            let d = pool.new_dict_from(&data).unwrap();
            pool.set_root(Value::Dict(d)).unwrap();
            pool.close().unwrap();
        }
        {
            let pool = open(&fname, OpenOptions::new()).unwrap();
            let d = pool.root().unwrap().as_dict().unwrap().clone();
            assert_eq!(d.len(), 5);
            for (k, v) in &data {
                assert_eq!(&d.get(k).unwrap(), v, "key {:?}", k);
            }
            d.del(&Value::from("a")).unwrap();
            pool.close().unwrap();
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        let d = pool.root().unwrap().as_dict().unwrap().clone();
        assert_eq!(d.len(), 4);
        assert!(d.get(&Value::from("a")).is_err());
        assert_eq!(d.get(&Value::Int(2)).unwrap(), Value::Float(3.7));
    }

    #[test]
    fn set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "set.pool");
        {
            let pool = create(&fname, CreateOptions::new()).unwrap();
            let s = pool.new_set().unwrap();
            for w in &["red", "green", "blue"] {
                s.add(Value::from(*w)).unwrap();
            }
            s.discard(&Value::from("green")).unwrap();
            pool.set_root(Value::Set(s)).unwrap();
            pool.close().unwrap();
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        let s = pool.root().unwrap().as_set().unwrap().clone();
        assert_eq!(s.len(), 2);
        assert!(s.contains(&Value::from("red")).unwrap());
        assert!(s.contains(&Value::from("blue")).unwrap());
        assert!(!s.contains(&Value::from("green")).unwrap());
    }

    #[test]
    fn persist_resurrect_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pool = create(pool_file(&dir, "prim.pool"), CreateOptions::new()).unwrap();
        let samples = vec![
            Value::None,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-5),
            Value::Int(256),
            Value::Int(1 << 40),
            Value::Int(-123456789),
            Value::Float(3.5),
            Value::Float(-0.25),
            Value::from(""),
            Value::from("hello"),
            Value::from("főo bàr"),
            Value::Bytes(vec![0, 1, 2, 255]),
        ];
        for v in samples {
            pool.set_root(v.clone()).unwrap();
            assert_eq!(pool.root().unwrap(), v, "roundtrip of {:?}", v);
        }
    }

    #[test]
    fn interning_reuses_bodies() {
        let dir = TempDir::new().unwrap();
        let pool = create(pool_file(&dir, "intern.pool"), CreateOptions::new()).unwrap();
        let list = pool.new_list().unwrap();
        pool.set_root(Value::List(list.clone())).unwrap();
        list.extend(&[
            Value::from("hello"),
            Value::from("hello"),
            Value::Int(5),
            Value::Int(5),
            Value::Int(123456),
            Value::Int(123456),
        ])
        .unwrap();
        let oids = crate::list::traverse(pool.mm(), list.oid).unwrap();
        assert_eq!(oids[0], oids[1], "equal short strings share a body");
        assert_eq!(oids[2], oids[3], "small ints are singletons");
        assert_eq!(oids[4], oids[5], "equal ints share a body");
    }

    #[test]
    fn clean_shutdown_flag_cycle() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "flag.pool");
        {
            let pool = create(&fname, CreateOptions::new()).unwrap();
            // Open pools carry a zero flag.
            assert_eq!(pool.mm().pool().header().clean_shutdown, 0);
            pool.close().unwrap();
            assert_eq!(pool.mm().pool().header().clean_shutdown, 1);
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        assert_eq!(pool.mm().pool().header().clean_shutdown, 0);
    }

    #[test]
    fn double_close_is_usage_error() {
        let dir = TempDir::new().unwrap();
        let pool = create(pool_file(&dir, "dbl.pool"), CreateOptions::new()).unwrap();
        pool.close().unwrap();
        match pool.close() {
            Err(Error::Usage(_)) => {}
            other => panic!("expected Usage, got {:?}", other),
        }
        match pool.new_list() {
            Err(Error::Usage(_)) => {}
            other => panic!("expected Usage, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn abort_rewinds_to_last_commit() {
        // 100 dicts allocated in a transaction, 40 referenced from the
        // root, aborted: the pool ends up where the last commit left it.
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "abort.pool");
        let pool = create(&fname, CreateOptions::new()).unwrap();
        let root = pool.new_list().unwrap();
        pool.set_root(Value::List(root.clone())).unwrap();
        // Warm the type table so the aborted transaction adds nothing.
        let warm = pool.new_dict().unwrap();
        root.append(Value::Dict(warm)).unwrap();
        root.pop(0).unwrap();

        let blocks_before = pool.allocated_blocks();
        pool.begin().unwrap();
        for i in 0..100 {
            let d = pool.new_dict().unwrap();
            if i < 40 {
                root.append(Value::Dict(d)).unwrap();
            }
        }
        pool.abort().unwrap();

        assert_eq!(pool.allocated_blocks(), blocks_before);
        assert_eq!(root.len(), 0);
        pool.close().unwrap();

        let pool = open(&fname, OpenOptions::new()).unwrap();
        let stats = pool.gc().unwrap();
        assert_eq!(stats.freed_objects, 0);
        assert_eq!(stats.freed_substructures, 0);
        assert_eq!(stats.refcount_fixes, 0);
    }

    #[test]
    fn list_gc_reachability() {
        // Dropping the only reference to a dict frees its body and its
        // keys-object immediately.
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "listgc.pool");
        let pool = create(&fname, CreateOptions::new()).unwrap();
        let list = pool.new_list().unwrap();
        pool.set_root(Value::List(list.clone())).unwrap();
        for i in 0..20 {
            let d = pool.new_dict().unwrap();
            d.set(Value::from("i"), Value::Int(i)).unwrap();
            list.append(Value::Dict(d)).unwrap();
        }
        let blocks_full = pool.allocated_blocks();

        for i in 0..10 {
            list.set(i, Value::None).unwrap();
        }
        // Each dict was a body plus a keys-object.
        assert_eq!(pool.allocated_blocks(), blocks_full - 20);
        pool.close().unwrap();

        let pool = open(&fname, OpenOptions::new()).unwrap();
        let list = pool.root().unwrap().as_list().unwrap().clone();
        assert_eq!(list.len(), 20);
        for i in 0..10 {
            assert_eq!(list.get(i).unwrap(), Value::None);
        }
        for i in 10..20 {
            let d = list.get(i).unwrap();
            let d = d.as_dict().unwrap();
            assert_eq!(d.get(&Value::from("i")).unwrap(), Value::Int(i as i64));
        }
        assert!(pool.gc().unwrap().clean());
    }

    #[test]
    fn crash_recovery_preserves_committed_state() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "crash.pool");
        {
            let pool = create(&fname, CreateOptions::new()).unwrap();
            let d = pool.new_dict().unwrap();
            d.set(Value::from("k"), Value::Int(1)).unwrap();
            pool.set_root(Value::Dict(d)).unwrap();
            // Dropped without close: the clean flag stays 0.
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        let d = pool.root().unwrap().as_dict().unwrap().clone();
        assert_eq!(d.get(&Value::from("k")).unwrap(), Value::Int(1));
        // The recovery sweep already ran; a second pass finds nothing.
        assert!(pool.gc().unwrap().clean());
    }

    #[test]
    fn crash_mid_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "midtx.pool");
        {
            let pool = create(&fname, CreateOptions::new()).unwrap();
            let list = pool.new_list().unwrap();
            list.append(Value::Int(1)).unwrap();
            pool.set_root(Value::List(list.clone())).unwrap();

            // A transaction left open at "crash" time.
            pool.begin().unwrap();
            list.append(Value::Int(2)).unwrap();
            list.set(0, Value::Int(99)).unwrap();
            pool.mm().pool().flush_all().unwrap();
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        let list = pool.root().unwrap().as_list().unwrap().clone();
        assert_eq!(list.values().unwrap(), vec![Value::Int(1)]);
        assert!(pool.gc().unwrap().clean());
    }

    #[test]
    fn reference_cycle_reclaimed_by_gc() {
        // Reference counts cannot free a cycle; the sweep is the backstop.
        let dir = TempDir::new().unwrap();
        let pool = create(pool_file(&dir, "cycle.pool"), CreateOptions::new()).unwrap();
        let root = pool.new_list().unwrap();
        pool.set_root(Value::List(root.clone())).unwrap();

        let a = pool.new_list().unwrap();
        let b = pool.new_list().unwrap();
        a.append(Value::List(b.clone())).unwrap();
        b.append(Value::List(a.clone())).unwrap();
        root.append(Value::List(a.clone())).unwrap();

        // Detach the cycle: a and b keep each other alive.
        root.pop(0).unwrap();
        let stats = pool.gc().unwrap();
        assert_eq!(stats.freed_objects, 2);
        assert_eq!(stats.freed_substructures, 2);
    }

    #[test]
    fn reopen_without_class_registration_fails() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "unreg.pool");
        {
            let pool = create(&fname, CreateOptions::new().register::<Guesser>()).unwrap();
            let g = pool
                .new_object::<Guesser>(&[Value::from("Eve"), Value::Int(10), Value::Int(3)])
                .unwrap();
            pool.set_root(Value::Object(g)).unwrap();
            pool.close().unwrap();
        }
        match open(&fname, OpenOptions::new()) {
            Err(Error::Corruption(msg)) => assert!(msg.contains("guess.Guesser")),
            other => panic!("expected Corruption, got {:?}", other.map(|_| ())),
        }
        // With the registry seeded the pool opens fine.
        let pool = open(&fname, OpenOptions::new().register::<Guesser>()).unwrap();
        let g = pool.root().unwrap().as_object().unwrap().clone();
        assert_eq!(g.get_attr("name").unwrap(), Value::from("Eve"));
    }

    #[test]
    fn refcounts_are_exact_after_reopen() {
        let dir = TempDir::new().unwrap();
        let fname = pool_file(&dir, "exact.pool");
        {
            let pool = create(&fname, CreateOptions::new()).unwrap();
            let root = pool.new_list().unwrap();
            pool.set_root(Value::List(root.clone())).unwrap();
            let shared = pool.new_tuple(&[Value::Int(1), Value::Int(2)]).unwrap();
            // The same tuple referenced three times.
            root.append(Value::Tuple(shared.clone())).unwrap();
            root.append(Value::Tuple(shared.clone())).unwrap();
            root.append(Value::Tuple(shared)).unwrap();
            pool.close().unwrap();
        }
        let pool = open(&fname, OpenOptions::new()).unwrap();
        // If any count had drifted, the sweep would repair it and say so.
        assert_eq!(pool.gc().unwrap().refcount_fixes, 0);
        let root = pool.root().unwrap().as_list().unwrap().clone();
        root.pop(0).unwrap();
        root.pop(0).unwrap();
        let t = root.get(0).unwrap();
        let t = t.as_tuple().unwrap();
        assert_eq!(t.get(0).unwrap(), Value::Int(1));
    }
}
