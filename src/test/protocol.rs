#[cfg(test)]
mod tests {
    use crate::protocol::*;
    use crate::*;
    use serde_json::json;

    fn to_json(command: &OutboundCommand) -> serde_json::Value {
        serde_json::to_value(command).unwrap()
    }

    #[test]
    fn test_outbound_command_shapes() -> Result<()> {
        assert_eq!(
            to_json(&OutboundCommand::Bootstrap { async_id: 1 }),
            json!({ "cmd": "bootstrap", "asyncId": 1 })
        );
        assert_eq!(
            to_json(&OutboundCommand::Call {
                server_id: CallTarget::Object(5),
                method_name: "greet".to_string(),
                async_id: 2,
                parameters: vec![json!("x")],
            }),
            json!({ "cmd": "call", "serverId": 5, "methodName": "greet", "asyncId": 2, "parameters": ["x"] })
        );
        assert_eq!(
            to_json(&OutboundCommand::Call {
                server_id: CallTarget::Class("test.Person".to_string()),
                method_name: "find".to_string(),
                async_id: 3,
                parameters: vec![],
            })["serverId"],
            json!("test.Person")
        );
        assert_eq!(to_json(&OutboundCommand::Poll), json!({ "cmd": "poll" }));
        assert_eq!(
            to_json(&OutboundCommand::Dispose { server_ids: vec![4, 9] }),
            json!({ "cmd": "dispose", "serverIds": [4, 9] })
        );
        assert_eq!(
            to_json(&OutboundCommand::Listen {
                server_id: 1,
                event_name: "alarm".to_string()
            }),
            json!({ "cmd": "listen", "serverId": 1, "eventName": "alarm" })
        );
        Ok(())
    }

    #[test]
    fn test_edit_array_shapes() -> Result<()> {
        let list = OutboundCommand::edit_list(1, "tags", vec![json!("a")], vec![json!("b")], vec![json!("b")]);
        assert_eq!(
            to_json(&list),
            json!({
                "cmd": "edit-array",
                "serverId": 1,
                "propertyName": "tags",
                "type": "update",
                "removed": ["a"],
                "added": ["b"],
                "array": ["b"]
            })
        );

        let mut put = serde_json::Map::new();
        put.insert("0".to_string(), json!({ "key": "k", "value": 1 }));
        let map = OutboundCommand::edit_map(1, "scores", vec![], put);
        let wire = to_json(&map);
        assert_eq!(wire["put"], json!({ "0": { "key": "k", "value": 1 } }));
        assert!(wire.get("added").is_none());
        assert!(wire.get("array").is_none());
        assert_eq!(map.name(), "edit-array");
        Ok(())
    }

    #[test]
    fn test_request_body_is_a_json_array() -> Result<()> {
        let body = encode_request_body(&[OutboundCommand::Poll, OutboundCommand::Bootstrap { async_id: 1 }])?;
        let parsed: serde_json::Value = serde_json::from_str(&body)?;
        assert_eq!(parsed, json!([{ "cmd": "poll" }, { "cmd": "bootstrap", "asyncId": 1 }]));
        Ok(())
    }

    #[test]
    fn test_response_body_forms() -> Result<()> {
        assert!(decode_response_body("")?.is_empty());
        assert!(decode_response_body("  \n")?.is_empty());

        let single = decode_response_body(r#"{"type":"set","object":{"serverId":1},"name":"age","data":3}"#)?;
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].kind, InboundKind::Set);
        assert_eq!(single[0].name.as_deref(), Some("age"));
        assert_eq!(single[0].data, json!(3));

        let many = decode_response_body(
            r#"[{"type":"mapClientId","data":{"clientId":-1,"serverId":7}},{"type":"load-type","object":"a.B"},{"type":"publish"}]"#,
        )?;
        let kinds: Vec<InboundKind> = many.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![InboundKind::MapClientId, InboundKind::LoadType, InboundKind::Unknown]);
        let mapping: MapClientIdData = many[0].data_as()?;
        assert_eq!((mapping.client_id, mapping.server_id), (-1, 7));

        assert!(matches!(decode_response_body("{not json"), Err(Error::Decode(_))));
        Ok(())
    }

    #[test]
    fn test_edit_array_data_single_or_many() -> Result<()> {
        let one = parse_edit_array_data(&json!({ "removed": ["a"], "added": ["b"] }))?;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].removed, vec![json!("a")]);
        assert!(one[0].put.is_empty());

        let many = parse_edit_array_data(&json!([{ "added": [1] }, { "put": [{ "key": "k", "value": 2 }] }]))?;
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].put[0].key, json!("k"));

        assert!(parse_edit_array_data(&serde_json::Value::Null)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_digest() -> Result<()> {
        let body = r#"[{"cmd":"poll"}]"#;
        let signature = digest(body);
        assert!(verify_digest(body, &signature));
        assert!(verify_digest(body, &format!(" {}\n", signature)));
        assert!(!verify_digest("[]", &signature));
        // SHA-256 is 32 bytes, 44 characters in padded base64
        assert_eq!(signature.len(), 44);
        Ok(())
    }

    #[test]
    fn test_headers_are_case_insensitive() -> Result<()> {
        let mut headers: Headers = [(HEADER_REQUEST_INDEX, "3")].into_iter().collect();
        assert_eq!(headers.get("x-proxymanager-requestindex"), Some("3"));

        headers.insert("X-PROXYMANAGER-REQUESTINDEX", "4");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(HEADER_REQUEST_INDEX), Some("4"));
        assert_eq!(headers.iter().next(), Some((HEADER_REQUEST_INDEX, "4")));

        assert_eq!(headers.remove("x-proxymanager-requestindex"), Some("4".to_string()));
        assert!(headers.is_empty());
        Ok(())
    }
}
