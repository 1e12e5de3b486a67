#[cfg(test)]
mod tests {
    use crate::protocol::OutboundCommand;
    use crate::test::harness::detached_object;
    use crate::*;
    use serde_json::json;

    fn set(server_id: i64, property: &str, value: serde_json::Value) -> OutboundCommand {
        OutboundCommand::Set {
            server_id,
            property_name: property.to_string(),
            value,
        }
    }

    fn list_change(added: Vec<Value>, removed: Vec<Value>) -> ListChange {
        ListChange { added, removed }
    }

    #[test]
    fn test_sets_coalesce_per_property() -> Result<()> {
        let mut queue = CommandQueue::new();
        queue.enqueue(set(1, "name", json!("Hello")));
        queue.enqueue(set(1, "age", json!(3)));
        queue.enqueue(set(2, "name", json!("other")));
        queue.enqueue(set(1, "name", json!("World")));

        let commands = queue.take_commands();
        assert_eq!(
            commands,
            vec![
                set(1, "age", json!(3)),
                set(2, "name", json!("other")),
                set(1, "name", json!("World")),
            ]
        );
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_add_then_remove_cancels() -> Result<()> {
        let owner = detached_object("test.Owner");
        let list = Value::List(ProxyList::new());
        let mut queue = CommandQueue::new();

        queue.record_list_change(&owner, "tags", &list, &list_change(vec![Value::from("x")], vec![]));
        queue.record_list_change(&owner, "tags", &list, &list_change(vec![], vec![Value::from("x")]));

        assert_eq!(queue.len(), 0);
        assert!(queue.take_dirty().is_empty());
        Ok(())
    }

    #[test]
    fn test_list_deltas_accumulate() -> Result<()> {
        let owner = detached_object("test.Owner");
        let list = Value::List(ProxyList::new());
        let mut queue = CommandQueue::new();

        queue.record_list_change(&owner, "tags", &list, &list_change(vec![], vec![Value::from("old")]));
        queue.record_list_change(&owner, "tags", &list, &list_change(vec![Value::from("a")], vec![]));
        queue.record_list_change(&owner, "tags", &list, &list_change(vec![Value::from("old")], vec![]));

        let dirty = queue.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].property, "tags");
        assert_eq!(
            dirty[0].delta,
            DirtyDelta::List {
                added: vec![Value::from("a")],
                removed: vec![],
            }
        );
        Ok(())
    }

    #[test]
    fn test_map_put_of_new_key_then_remove_cancels() -> Result<()> {
        let owner = detached_object("test.Owner");
        let map = ProxyMap::new();
        let container = Value::Map(map.clone());
        let mut queue = CommandQueue::new();

        let put = MapChange {
            kind: MapChangeKind::Put,
            entries: vec![MapEntryChange {
                key: Value::from("k"),
                value: Value::Int(1),
                old_value: None,
            }],
        };
        let remove = MapChange {
            kind: MapChangeKind::Remove,
            entries: vec![MapEntryChange {
                key: Value::from("k"),
                value: Value::Int(1),
                old_value: None,
            }],
        };
        queue.record_map_change(&owner, "scores", &container, &put);
        queue.record_map_change(&owner, "scores", &container, &remove);
        assert!(!queue.is_dirty(map.id()));

        // an existing key that is overwritten and then removed still needs the removal
        let overwrite = MapChange {
            kind: MapChangeKind::Put,
            entries: vec![MapEntryChange {
                key: Value::from("existing"),
                value: Value::Int(2),
                old_value: Some(Value::Int(1)),
            }],
        };
        let remove_existing = MapChange {
            kind: MapChangeKind::Remove,
            entries: vec![MapEntryChange {
                key: Value::from("existing"),
                value: Value::Int(2),
                old_value: None,
            }],
        };
        queue.record_map_change(&owner, "scores", &container, &overwrite);
        queue.record_map_change(&owner, "scores", &container, &remove_existing);
        let dirty = queue.take_dirty();
        assert_eq!(
            dirty[0].delta,
            DirtyDelta::Map {
                put: vec![],
                removed: vec![Value::from("existing")],
            }
        );
        Ok(())
    }

    #[test]
    fn test_clear_dirty_drops_redundant_delta() -> Result<()> {
        let owner = detached_object("test.Owner");
        let list = ProxyList::new();
        let mut queue = CommandQueue::new();
        queue.record_list_change(&owner, "tags", &Value::List(list.clone()), &list_change(vec![Value::Int(1)], vec![]));
        assert!(queue.is_dirty(list.id()));

        queue.clear_dirty(list.id());
        assert!(!queue.is_dirty(list.id()));
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_deferred_calls_kept_apart() -> Result<()> {
        let mut queue = CommandQueue::new();
        queue.defer_call(OutboundCommand::Call {
            server_id: crate::protocol::CallTarget::Object(1),
            method_name: "greet".to_string(),
            async_id: 7,
            parameters: vec![],
        });
        queue.enqueue(set(1, "name", json!("x")));

        assert!(queue.has_deferred_calls());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take_commands().len(), 1);
        let deferred = queue.take_deferred_calls();
        assert_eq!(deferred[0].async_id(), Some(7));
        assert!(!queue.has_deferred_calls());
        Ok(())
    }

    #[test]
    fn test_forget_object() -> Result<()> {
        let owner = detached_object("test.Owner");
        owner.assign_id(-3);
        let other = detached_object("test.Owner");
        other.assign_id(9);
        let list = Value::List(ProxyList::new());
        let mut queue = CommandQueue::new();

        queue.enqueue(set(-3, "name", json!("gone")));
        queue.enqueue(set(9, "name", json!("kept")));
        queue.enqueue(OutboundCommand::Listen {
            server_id: -3,
            event_name: "alarm".to_string(),
        });
        queue.record_list_change(&owner, "tags", &list, &list_change(vec![Value::Int(1)], vec![]));
        queue.queue_dispose(&owner);
        queue.queue_dispose(&other);
        queue.queue_dispose(&other);

        queue.forget_object(-3);

        assert_eq!(queue.take_commands(), vec![set(9, "name", json!("kept"))]);
        assert!(queue.take_dirty().is_empty());
        let disposed = queue.take_disposed();
        assert_eq!(disposed.len(), 1);
        assert_eq!(disposed[0].id(), 9);
        Ok(())
    }
}
