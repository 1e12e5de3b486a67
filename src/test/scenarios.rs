#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use crate::test::harness::*;
    use crate::*;
    use serde_json::json;

    fn nickname_log(root: &ProxyObject) -> Result<Rc<RefCell<Vec<Value>>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        root.add_listener("changeNickname", move |e| sink.borrow_mut().push(e.data.clone()))?;
        Ok(log)
    }

    #[test]
    fn test_bootstrap_of_predefined_class() -> Result<()> {
        let transport = ScriptedTransport::new(|_, _| {
            Reply::Now(json!([{ "type": "bootstrap", "data": { "bootstrap": { "serverId": 1, "clazz": "Root" } } }]))
        });
        let session = Session::new(transport.clone());
        session.define_class(ClassDefinition::new("Root"))?;

        let root = session.bootstrap()?;
        assert_eq!(root.class_name(), "Root");
        assert_eq!(root.server_id(), Some(1));
        assert_eq!(transport.request_count(), 1);
        assert!(session.bootstrap()?.ptr_eq(&root));
        Ok(())
    }

    #[test]
    fn test_bootstrap_of_unknown_bare_class_fails() -> Result<()> {
        let transport = ScriptedTransport::new(|_, _| {
            Reply::Now(json!([{ "type": "bootstrap", "data": { "bootstrap": { "serverId": 1, "clazz": "Root" } } }]))
        });
        let session = Session::new(transport);
        assert_eq!(session.bootstrap().unwrap_err(), Error::UnknownClass("Root".to_string()));
        assert_eq!(session.exception(), Some(Error::UnknownClass("Root".to_string())));
        Ok(())
    }

    #[test]
    fn test_queued_sets_coalesce_into_one_command() -> Result<()> {
        let (session, transport, root) = connect()?;
        root.set("name", "Hello")?;
        root.set("name", "World")?;
        assert_eq!(session.queued_count(), 1);

        session.flush()?;
        let sets = transport.last_commands();
        assert_eq!(
            sets,
            vec![json!({ "cmd": "set", "serverId": 1, "propertyName": "name", "value": "World" })]
        );
        Ok(())
    }

    #[test]
    fn test_early_response_waits_for_its_predecessor() -> Result<()> {
        let (session, transport, root) = connect()?;
        transport.set_responder(|request, _| {
            Reply::Hold(json!([{
                "type": "set",
                "object": { "serverId": 1 },
                "name": "nickname",
                "data": format!("r{}", request.request_index)
            }]))
        });
        let log = nickname_log(&root)?;

        assert_eq!(session.flush_with(true, true)?, Some(2));
        assert_eq!(session.flush_with(true, true)?, Some(3));

        assert!(transport.release(3));
        assert!(session.pump(Some(Duration::ZERO))?);
        assert!(log.borrow().is_empty());
        assert_eq!(root.get("nickname")?, Value::Null);
        assert_eq!(session.stats().responses_buffered, 1);

        assert!(transport.release(2));
        assert!(session.pump(Some(Duration::ZERO))?);
        assert_eq!(*log.borrow(), vec![Value::from("r2"), Value::from("r3")]);
        assert!(session.is_idle());
        Ok(())
    }

    #[test]
    fn test_exception_without_async_id_fails_the_blocking_call() -> Result<()> {
        let (session, transport, root) = connect()?;
        transport.set_responder(|_, _| Reply::Now(json!([{ "type": "exception", "data": { "message": "bad" } }])));

        let expected = Error::Server {
            class: String::new(),
            message: "bad".to_string(),
        };
        assert_eq!(root.invoke("greet", vec![]), Err(expected.clone()));
        assert_eq!(session.exception(), Some(expected));
        assert_eq!(session.pending_call_count(), 0);
        Ok(())
    }

    #[test]
    fn test_responses_apply_in_issue_order() -> Result<()> {
        for seed in 1..=5u64 {
            let (session, transport, root) = connect()?;
            let mut next_id = 1000;
            transport.set_responder(move |_, commands| Reply::Hold(standard_reply(commands, &mut next_id)));

            let completed = Rc::new(RefCell::new(Vec::new()));
            for i in 0..6i64 {
                let sink = completed.clone();
                root.invoke_async("add", vec![Value::Int(i)])
                    .then(move |outcome| {
                        if let Ok(v) = outcome {
                            sink.borrow_mut().push(v.as_int().unwrap_or(-1));
                        }
                    });
                session.flush()?;
            }
            assert_eq!(transport.held_count(), 6);

            let mut order: Vec<u64> = (2..=7).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));
            for index in order {
                assert!(transport.release(index));
                session.pump(Some(Duration::ZERO))?;
            }
            session.run_until_idle(None)?;

            assert_eq!(*completed.borrow(), (0..6).collect::<Vec<i64>>(), "seed {}", seed);
        }
        Ok(())
    }

    #[test]
    fn test_blocking_call_carries_queued_async_calls() -> Result<()> {
        let (session, transport, root) = connect()?;
        let mut next_id = 1000;
        transport.set_responder(move |request, commands| {
            let body = standard_reply(commands, &mut next_id);
            if request.is_async {
                Reply::Hold(body)
            } else {
                Reply::Now(body)
            }
        });

        let first = root.invoke_async("greet", vec![Value::from("a")]);
        let queued: Vec<Promise> = ["b", "c", "d"]
            .iter()
            .map(|name| root.invoke_async("greet", vec![Value::from(*name)]))
            .collect();
        assert_eq!(transport.request_count(), 2);

        assert_eq!(root.invoke("add", vec![Value::Int(1), Value::Int(2)])?, Value::Int(3));
        assert_eq!(transport.request_count(), 3);
        assert_eq!(commands_named(&transport.commands(2), "call").len(), 4);
        for (promise, name) in queued.iter().zip(["b", "c", "d"]) {
            assert_eq!(promise.result(), Some(Ok(Value::from(format!("hello {}", name)))));
        }
        assert!(!first.is_settled());

        assert!(transport.release(2));
        session.run_until_idle(None)?;
        assert_eq!(first.result(), Some(Ok(Value::from("hello a"))));
        Ok(())
    }

    #[test]
    fn test_cancelled_collection_edit_sends_nothing() -> Result<()> {
        let (session, transport, root) = connect()?;
        let tags = root.get("tags")?;
        let list = tags.expect_list()?;
        list.push(Value::from("x"));
        list.remove(&Value::from("x"));

        let before = transport.request_count();
        assert_eq!(session.flush()?, None);
        assert_eq!(transport.request_count(), before);
        Ok(())
    }

    #[test]
    fn test_new_object_carries_initial_collections() -> Result<()> {
        let (session, transport, _root) = connect()?;
        let obj = session.create_object("test.Person")?;
        obj.get("tags")?.expect_list()?.push(Value::from("fresh"));
        obj.set("age", 30)?;
        assert_eq!(session.queued_count(), 0);

        session.flush()?;
        let commands = transport.last_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["properties"], json!({ "age": 30, "tags": ["fresh"] }));

        session.run_until_idle(None)?;
        obj.get("tags")?.expect_list()?.push(Value::from("later"));
        session.flush()?;
        let edit = &transport.last_commands()[0];
        assert_eq!(edit["cmd"], json!("edit-array"));
        assert_eq!(edit["serverId"], json!(1000));
        assert_eq!(edit["array"], json!(["fresh", "later"]));
        Ok(())
    }

    #[test]
    fn test_object_disposed_before_its_id_arrives() -> Result<()> {
        let (session, transport, _root) = connect()?;
        let mut next_id = 1000;
        transport.set_responder(move |_, commands| Reply::Hold(standard_reply(commands, &mut next_id)));

        let obj = session.create_object("test.Person")?;
        session.flush()?;
        obj.dispose()?;
        assert!(obj.is_pending());

        standard_responder_after(&transport);
        assert!(transport.release(2));
        session.run_until_idle(None)?;

        let commands = transport.last_commands();
        assert_eq!(commands, vec![json!({ "cmd": "dispose", "serverIds": [1000] })]);
        assert_eq!(session.object(1000)?, None);
        Ok(())
    }

    fn standard_responder_after(transport: &ScriptedTransport) {
        let mut next_id = 5000;
        transport.set_responder(move |_, commands| Reply::Now(standard_reply(commands, &mut next_id)));
    }
}
