#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::protocol::Headers;
    use crate::*;

    fn request(index: u64) -> TransportRequest {
        TransportRequest {
            request_index: index,
            headers: Headers::new(),
            body: "[]".to_string(),
            is_async: true,
            timeout: None,
        }
    }

    #[test]
    fn test_threaded_transport_round_trip() -> Result<()> {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let mut transport = ThreadedTransport::new(2, move |req: &TransportRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            TransportResponse::ok(0, format!("[{}]", req.request_index))
        })?;

        for index in 1..=3 {
            transport.send(request(index))?;
        }
        let mut indices = Vec::new();
        while indices.len() < 3 {
            if let Some(response) = transport.receive(Some(Duration::from_secs(5)))? {
                assert_eq!(response.content, format!("[{}]", response.request_index));
                indices.push(response.request_index);
            }
        }
        indices.sort();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(served.load(Ordering::SeqCst), 3);
        assert!(transport.receive(Some(Duration::ZERO))?.is_none());
        Ok(())
    }

    #[test]
    fn test_threaded_transport_needs_a_worker() -> Result<()> {
        let result = ThreadedTransport::new(0, |_: &TransportRequest| TransportResponse::ok(0, ""));
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn test_response_status() -> Result<()> {
        assert!(TransportResponse::ok(1, "[]").is_success());

        let failed = TransportResponse::failed(2, 503, "unavailable");
        assert!(!failed.is_success());
        assert_eq!(
            failed.to_error(),
            Error::Transport {
                status: 503,
                message: "unavailable".to_string()
            }
        );

        let mut redirected = TransportResponse::ok(3, "");
        redirected.status_code = 302;
        assert!(matches!(redirected.to_error(), Error::Transport { status: 302, .. }));
        Ok(())
    }

    #[test]
    fn test_session_over_threaded_transport() -> Result<()> {
        let transport = ThreadedTransport::new(1, |req: &TransportRequest| {
            let commands: Vec<serde_json::Value> = serde_json::from_str(&req.body).unwrap_or_default();
            let mut next_id = 1000;
            let body = crate::test::harness::standard_reply(&commands, &mut next_id);
            TransportResponse::ok(req.request_index, body.to_string())
        })?;
        let session = Session::with_config(
            transport,
            SessionConfig {
                timeout_ms: Some(5000),
                ..SessionConfig::default()
            },
        );

        let root = session.bootstrap()?;
        assert_eq!(root.get("name")?, Value::from("root"));
        assert_eq!(root.invoke("add", vec![Value::Int(2), Value::Int(40)])?, Value::Int(42));
        Ok(())
    }
}
