#[cfg(test)]
mod tests {
    use crate::test::harness::detached_object;
    use crate::*;

    #[test]
    fn test_client_ids_decrease_and_are_never_reused() -> Result<()> {
        let mut store = ObjectStore::new();
        let a = detached_object("test.Thing");
        let b = detached_object("test.Thing");

        assert_eq!(store.register_pending(&a), -1);
        assert_eq!(store.register_pending(&b), -2);
        assert_eq!(a.id(), -1);
        assert!(a.is_pending());

        store.retire(-2);
        let c = detached_object("test.Thing");
        assert_eq!(store.register_pending(&c), -3);
        assert_eq!(store.get_or_null(-2).unwrap_err(), Error::StaleClientId(-2));
        Ok(())
    }

    #[test]
    fn test_unsent_in_creation_order() -> Result<()> {
        let mut store = ObjectStore::new();
        let a = detached_object("test.Thing");
        let b = detached_object("test.Thing");
        store.register_pending(&a);
        store.register_pending(&b);

        let unsent = store.unsent();
        assert_eq!(unsent, vec![a.clone(), b.clone()]);

        store.mark_sent(a.id());
        assert_eq!(store.unsent(), vec![b]);
        assert!(store.has_unsent());
        Ok(())
    }

    #[test]
    fn test_promote() -> Result<()> {
        let mut store = ObjectStore::new();
        let obj = detached_object("test.Thing");
        let client_id = store.register_pending(&obj);

        let promoted = store.promote(client_id, 500)?;
        assert_eq!(promoted, obj);
        assert_eq!(obj.id(), 500);
        assert_eq!(obj.server_id(), Some(500));
        assert_eq!(store.get_or_null(500)?, Some(obj));
        assert_eq!(store.get_or_null(client_id).unwrap_err(), Error::StaleClientId(client_id));
        assert_eq!(store.promote(client_id, 501).unwrap_err(), Error::StaleClientId(client_id));
        assert!(!store.has_unsent());
        Ok(())
    }

    #[test]
    fn test_promote_unknown_client_id() -> Result<()> {
        let mut store = ObjectStore::new();
        assert!(matches!(store.promote(-9, 10), Err(Error::Protocol(_))));
        Ok(())
    }

    #[test]
    fn test_server_ids_register_once() -> Result<()> {
        let mut store = ObjectStore::new();
        let obj = detached_object("test.Thing");
        store.register_server(42, &obj)?;

        let twin = detached_object("test.Thing");
        assert!(matches!(store.register_server(42, &twin), Err(Error::Protocol(_))));
        assert!(matches!(store.register_server(0, &twin), Err(Error::Protocol(_))));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn test_remove() -> Result<()> {
        let mut store = ObjectStore::new();
        let obj = detached_object("test.Thing");
        store.register_server(3, &obj)?;

        assert_eq!(store.remove(3), Some(obj));
        assert_eq!(store.get_or_null(3)?, None);
        assert!(store.is_empty());
        Ok(())
    }
}
