//! In-process transport that answers requests from a script, for driving a
//! session without a server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::{json, Value as Json};

use crate::protocol::HEADER_REQUEST_INDEX;
use crate::{
    ClassDefinition, ClassRef, ClassRegistry, Error, ProxyObject, Result, Session, SessionConfig, Transport,
    TransportRequest, TransportResponse,
};

pub enum Reply {
    /// Deliver this body on the next receive
    Now(Json),
    /// Keep the response until `release` is called for its request index
    Hold(Json),
    /// Deliver a transport-level failure
    Fail(u16, String),
    /// Refuse the request at send time
    Refuse(String),
    /// Never answer
    Silent,
}

type Responder = Box<dyn FnMut(&TransportRequest, &[Json]) -> Reply>;

struct ScriptState {
    requests: Vec<TransportRequest>,
    ready: VecDeque<TransportResponse>,
    held: Vec<TransportResponse>,
    responder: Responder,
}

#[derive(Clone)]
pub struct ScriptedTransport(Rc<RefCell<ScriptState>>);

impl ScriptedTransport {
    pub fn new(responder: impl FnMut(&TransportRequest, &[Json]) -> Reply + 'static) -> Self {
        ScriptedTransport(Rc::new(RefCell::new(ScriptState {
            requests: Vec::new(),
            ready: VecDeque::new(),
            held: Vec::new(),
            responder: Box::new(responder),
        })))
    }

    pub fn set_responder(&self, responder: impl FnMut(&TransportRequest, &[Json]) -> Reply + 'static) {
        self.0.borrow_mut().responder = Box::new(responder);
    }

    pub fn request_count(&self) -> usize {
        self.0.borrow().requests.len()
    }

    pub fn request(&self, n: usize) -> TransportRequest {
        self.0.borrow().requests[n].clone()
    }

    /// Commands of the `n`th request sent (0-based)
    pub fn commands(&self, n: usize) -> Vec<Json> {
        serde_json::from_str(&self.0.borrow().requests[n].body).unwrap()
    }

    pub fn last_commands(&self) -> Vec<Json> {
        let count = self.request_count();
        self.commands(count - 1)
    }

    pub fn held_count(&self) -> usize {
        self.0.borrow().held.len()
    }

    /// Moves a held response to the delivery queue
    pub fn release(&self, request_index: u64) -> bool {
        let mut state = self.0.borrow_mut();
        match state.held.iter().position(|r| r.request_index == request_index) {
            Some(pos) => {
                let response = state.held.remove(pos);
                state.ready.push_back(response);
                true
            }
            None => false,
        }
    }

    pub fn push(&self, response: TransportResponse) {
        self.0.borrow_mut().ready.push_back(response);
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, request: TransportRequest) -> Result<()> {
        let commands: Vec<Json> = serde_json::from_str(&request.body)?;
        let index = request.request_index;
        let mut state = self.0.borrow_mut();
        let reply = (state.responder)(&request, &commands);
        state.requests.push(request);
        match reply {
            Reply::Now(body) => state.ready.push_back(response(index, &body)),
            Reply::Hold(body) => state.held.push(response(index, &body)),
            Reply::Fail(status, message) => state
                .ready
                .push_back(TransportResponse::failed(index, status, message)),
            Reply::Refuse(message) => {
                return Err(Error::Transport { status: 0, message });
            }
            Reply::Silent => {}
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Option<TransportResponse>> {
        Ok(self.0.borrow_mut().ready.pop_front())
    }
}

pub fn response(request_index: u64, body: &Json) -> TransportResponse {
    let mut response = TransportResponse::ok(request_index, body.to_string());
    response.headers.insert(HEADER_REQUEST_INDEX, request_index.to_string());
    response
}

pub fn async_id(command: &Json) -> u64 {
    command["asyncId"].as_u64().unwrap()
}

pub fn commands_named<'a>(commands: &'a [Json], cmd: &str) -> Vec<&'a Json> {
    commands.iter().filter(|c| c["cmd"] == cmd).collect()
}

pub fn person_class() -> Json {
    json!({
        "className": "test.Person",
        "properties": {
            "name": { "check": "String", "sync": "queue" },
            "age": { "check": "Integer" },
            "nickname": { "check": "String", "nullable": true, "sync": "queue" },
            "status": { "check": "String", "readOnly": true },
            "tags": { "array": "wrap", "sync": "queue" },
            "scores": { "map": true, "sync": "queue" },
            "friends": { "array": "wrap" },
            "details": { "check": "String", "onDemand": true, "nullable": true },
            "partner": { "clazz": "test.Person", "nullable": true, "sync": "queue" }
        },
        "methods": {
            "greet": {},
            "add": {},
            "lookup": { "cacheResult": true },
            "find": { "staticMethod": true },
            "history": { "returnArray": "wrap" }
        },
        "events": {
            "alarm": {}
        }
    })
}

pub fn person_object(server_id: i64, name: &str) -> Json {
    json!({
        "serverId": server_id,
        "clazz": person_class(),
        "order": ["name"],
        "values": { "name": name }
    })
}

/// `return` commands for every call in `commands`, computed by `result`
pub fn returns(commands: &[Json], result: impl Fn(&str, &[Json]) -> Json) -> Vec<Json> {
    commands
        .iter()
        .filter(|c| c["cmd"] == "call")
        .map(|c| {
            let params = c["parameters"].as_array().cloned().unwrap_or_default();
            json!({
                "type": "return",
                "data": {
                    "asyncId": async_id(c),
                    "result": result(c["methodName"].as_str().unwrap_or_default(), &params)
                }
            })
        })
        .collect()
}

/// Call results of the standard script: `greet` returns "hello <arg>",
/// `add` sums its arguments, everything else returns null.
pub fn standard_result(method: &str, params: &[Json]) -> Json {
    match method {
        "greet" => json!(format!("hello {}", params.first().and_then(Json::as_str).unwrap_or(""))),
        "add" => json!(params.iter().filter_map(Json::as_i64).sum::<i64>()),
        _ => Json::Null,
    }
}

/// Answers like a cooperative server: bootstraps a Person with id 1, maps
/// each `new` to the next server id from 1000 and returns `result` from
/// every call.
pub fn server_reply(commands: &[Json], next_id: &mut i64, result: &dyn Fn(&str, &[Json]) -> Json) -> Json {
    let mut out = Vec::new();
    for c in commands {
        match c["cmd"].as_str() {
            Some("bootstrap") => out.push(json!({
                "type": "bootstrap",
                "data": {
                    "asyncId": async_id(c),
                    "sessionId": "session-1",
                    "bootstrap": person_object(1, "root")
                }
            })),
            Some("new") => {
                out.push(json!({
                    "type": "mapClientId",
                    "data": { "clientId": c["clientId"], "serverId": *next_id }
                }));
                *next_id += 1;
            }
            _ => {}
        }
    }
    out.extend(returns(commands, result));
    Json::Array(out)
}

pub fn standard_reply(commands: &[Json], next_id: &mut i64) -> Json {
    server_reply(commands, next_id, &standard_result)
}

pub fn standard_transport() -> ScriptedTransport {
    returning_transport(standard_result)
}

pub fn returning_transport(result: impl Fn(&str, &[Json]) -> Json + 'static) -> ScriptedTransport {
    let mut next_id = 1000;
    ScriptedTransport::new(move |_, commands| Reply::Now(server_reply(commands, &mut next_id, &result)))
}

/// A bootstrapped session on the standard script
pub fn connect() -> Result<(Session, ScriptedTransport, ProxyObject)> {
    connect_with(SessionConfig::default())
}

pub fn connect_with(config: SessionConfig) -> Result<(Session, ScriptedTransport, ProxyObject)> {
    connect_over(standard_transport(), config)
}

/// A bootstrapped session whose calls return `result`
pub fn connect_returning(
    result: impl Fn(&str, &[Json]) -> Json + 'static,
) -> Result<(Session, ScriptedTransport, ProxyObject)> {
    connect_over(returning_transport(result), SessionConfig::default())
}

fn connect_over(transport: ScriptedTransport, config: SessionConfig) -> Result<(Session, ScriptedTransport, ProxyObject)> {
    let session = Session::with_config(transport.clone(), config);
    let root = session.bootstrap()?;
    Ok((session, transport, root))
}

/// Sends an empty request and answers it with `body`, as if the server had
/// pushed those commands, then goes back to the standard script.
pub fn deliver(session: &Session, transport: &ScriptedTransport, body: Json) -> Result<()> {
    let mut once = Some(body);
    let mut next_id = 2000;
    transport.set_responder(move |_, commands| match once.take() {
        Some(body) => Reply::Now(body),
        None => Reply::Now(standard_reply(commands, &mut next_id)),
    });
    session.flush_with(true, true)?;
    session.run_until_idle(None)?;
    Ok(())
}

/// An object of an empty class that belongs to no session
pub fn detached_object(class_name: &str) -> ProxyObject {
    let mut registry = ClassRegistry::new();
    let class = registry
        .resolve_or_create(&ClassRef::from(ClassDefinition::new(class_name)))
        .unwrap()
        .unwrap();
    ProxyObject::new(class, Weak::new(), Vec::new())
}
