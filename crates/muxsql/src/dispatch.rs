//! The default handler of every new stream.

use std::sync::Arc;

use muxsql_frame::{code, Message, SchemaScope};
use muxsql_mux::{HandlerError, Stream, StreamHandler, Transition};
use tracing::{debug, info, warn};

use crate::bridge::ProcessPipe;
use crate::credentials::{transmit_once, CredentialManager};
use crate::engine::{Engine, EngineError, OutputFormat, TailRequest};

/// Access key with administrative rights.
pub const ROOT_USER: &str = "root";

/// Which requests need the root key beyond the fixed rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Restrict schema queries to root. Off by default: any authenticated
    /// key may read the schema.
    pub schema_requires_root: bool,
}

impl From<EngineError> for HandlerError {
    fn from(err: EngineError) -> Self {
        if err.is_revealable() {
            HandlerError::revealable(code::INTERNAL, err.to_string())
        } else {
            HandlerError::internal(err.to_string())
        }
    }
}

/// Answers one-shot requests and opens bridges for tail and push.
pub struct RequestHandler {
    engine: Arc<dyn Engine>,
    credentials: Arc<CredentialManager>,
    access_key: String,
    replication_id: String,
    policy: AccessPolicy,
}

impl RequestHandler {
    pub fn new(
        engine: Arc<dyn Engine>,
        credentials: Arc<CredentialManager>,
        access_key: impl Into<String>,
        replication_id: impl Into<String>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            engine,
            credentials,
            access_key: access_key.into(),
            replication_id: replication_id.into(),
            policy,
        }
    }

    fn is_root(&self) -> bool {
        self.access_key == ROOT_USER
    }

    fn require_root(&self, request: &'static str) -> Result<(), HandlerError> {
        if self.is_root() {
            Ok(())
        } else {
            info!(access_key = %self.access_key, request, "authorization denied");
            Err(HandlerError::revealable(
                code::AUTHORIZATION,
                "Authorization error",
            ))
        }
    }

    fn reply_and_close(stream: &Stream, output: Vec<u8>) -> Result<Transition, HandlerError> {
        stream
            .send_data(output, true)
            .map_err(|err| HandlerError::internal(err.to_string()))?;
        stream.close();
        Ok(Transition::Stay)
    }

    fn create_user(&self, stream: &Stream) -> Result<Transition, HandlerError> {
        let access_key = self.credentials.generate_access_key();
        let mut creds = self
            .credentials
            .generate_credentials(access_key)
            .map_err(|err| HandlerError::internal(err.to_string()))?;
        self.engine
            .create_user(&creds.access_key, &creds.b64_encrypted_key())?;
        info!(access_key = %creds.access_key, "user created");

        transmit_once(&mut creds, |message| stream.send(message))
            .map_err(|err| HandlerError::internal(err.to_string()))?;
        stream.close();
        Ok(Transition::Stay)
    }
}

impl StreamHandler for RequestHandler {
    fn handle_message(
        &mut self,
        message: Message,
        stream: &Stream,
    ) -> Result<Transition, HandlerError> {
        debug!(stream = stream.id(), message = message.name(), "request");
        match message {
            Message::Query { query, format } => {
                self.require_root("query")?;
                let output = self.engine.run_query(&query, OutputFormat::from(format))?;
                Self::reply_and_close(stream, output)
            }
            Message::SchemaQuery { scope, name } => {
                if self.policy.schema_requires_root {
                    self.require_root("schema")?;
                }
                let output = match (scope, name) {
                    (SchemaScope::All, _) => self.engine.dump_schema()?,
                    (SchemaScope::Table, Some(name)) => self.engine.dump_table(&name)?,
                    (SchemaScope::View, Some(name)) => self.engine.dump_view(&name)?,
                    (_, None) => return Err(HandlerError::unexpected("malformed message")),
                };
                Self::reply_and_close(stream, output)
            }
            Message::CreateDb { name } => {
                warn!(database = %name, "refused database creation over a connection");
                Err(HandlerError::revealable(
                    code::UNSUPPORTED,
                    "Database creation not supported. Use `muxsql create-db <db>`.",
                ))
            }
            Message::CreateUser => {
                self.require_root("create-user")?;
                self.create_user(stream)
            }
            Message::RequestTail {
                table,
                since,
                filter_expr,
            } => {
                let request = TailRequest {
                    table,
                    since,
                    filter_expr,
                };
                let child = self
                    .engine
                    .tail(&self.access_key, &request, &self.replication_id)?;
                info!(stream = stream.id(), table = %request.table, since, "tail opened");
                Ok(Transition::Replace(Box::new(ProcessPipe::spawn(
                    child, stream,
                )?)))
            }
            Message::PushPromise { table } => {
                let child = self
                    .engine
                    .write_csv(&self.access_key, &table, &self.replication_id)?;
                info!(stream = stream.id(), %table, "push opened");
                Ok(Transition::Replace(Box::new(ProcessPipe::spawn(
                    child, stream,
                )?)))
            }
            Message::Data { .. } => Err(HandlerError::unexpected(
                "unexpected data on non-established connection",
            )),
            Message::Credentials { .. } => Err(HandlerError::unexpected("unexpected message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Child;
    use std::sync::Mutex;

    use muxsql_frame::{Frame, FrameKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cipher::PlaintextCipher;

    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<String>>,
        fail_with: Option<String>,
    }

    impl FakeEngine {
        fn record(&self, call: String) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(call);
            match &self.fail_with {
                Some(text) => Err(EngineError::Failed(text.clone())),
                None => Ok(()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Engine for FakeEngine {
        fn run_query(&self, query: &str, format: OutputFormat) -> Result<Vec<u8>, EngineError> {
            self.record(format!("query {} {query}", format.as_str()))?;
            Ok(b"1\n".to_vec())
        }

        fn dump_schema(&self) -> Result<Vec<u8>, EngineError> {
            self.record("schema".to_string())?;
            Ok(b"CREATE TABLE t (a INTEGER);\n".to_vec())
        }

        fn dump_table(&self, name: &str) -> Result<Vec<u8>, EngineError> {
            self.record(format!("table {name}"))?;
            Ok(b"CREATE TABLE t (a INTEGER);\n".to_vec())
        }

        fn dump_view(&self, name: &str) -> Result<Vec<u8>, EngineError> {
            self.record(format!("view {name}"))?;
            Ok(b"CREATE VIEW v AS SELECT 1;\n".to_vec())
        }

        fn create_user(&self, access_key: &str, b64_encrypted_key: &str) -> Result<(), EngineError> {
            self.record(format!("create-user {access_key} {b64_encrypted_key}"))
        }

        fn tail(
            &self,
            _access_key: &str,
            request: &TailRequest,
            _replication_id: &str,
        ) -> Result<Child, EngineError> {
            self.record(format!("tail {}", request.table))?;
            Err(EngineError::Failed("no such table".to_string()))
        }

        fn write_csv(
            &self,
            _access_key: &str,
            table: &str,
            _replication_id: &str,
        ) -> Result<Child, EngineError> {
            self.record(format!("write-csv {table}"))?;
            Err(EngineError::Spawn(std::io::Error::other("no engine")))
        }

        fn replication_id(&self, _device_uuid: &str) -> Result<String, EngineError> {
            Ok("7".to_string())
        }

        fn private_key_as_stored(
            &self,
            _access_key: &str,
        ) -> Result<Option<Vec<u8>>, EngineError> {
            Ok(None)
        }
    }

    fn handler(engine: &Arc<FakeEngine>, access_key: &str, policy: AccessPolicy) -> RequestHandler {
        let credentials = Arc::new(CredentialManager::with_rng(
            StdRng::seed_from_u64(11),
            Arc::new(PlaintextCipher),
        ));
        RequestHandler::new(engine.clone(), credentials, access_key, "7", policy)
    }

    fn stream() -> (Stream, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (Stream::new(1, tx), rx)
    }

    fn handle(
        handler: &mut RequestHandler,
        message: Message,
    ) -> (Result<Transition, HandlerError>, Stream, mpsc::Receiver<Frame>) {
        let (stream, rx) = stream();
        let result = handler.handle_message(message, &stream);
        (result, stream, rx)
    }

    fn query() -> Message {
        Message::Query {
            query: "select 1;".to_string(),
            format: muxsql_frame::QueryFormat::Raw,
        }
    }

    #[test]
    fn root_query_replies_and_closes() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, ROOT_USER, AccessPolicy::default());
        let (result, stream, mut rx) = handle(&mut h, query());

        assert!(matches!(result, Ok(Transition::Stay)));
        assert_eq!(
            Message::decode(rx.try_recv().unwrap().payload).unwrap(),
            Message::data("1\n", true)
        );
        assert_eq!(rx.try_recv().unwrap().kind, FrameKind::Close);
        assert!(stream.is_closed());
        assert_eq!(engine.calls(), vec!["query raw select 1;"]);
    }

    #[test]
    fn non_root_query_never_reaches_the_engine() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, "u1", AccessPolicy::default());
        let (result, _stream, mut rx) = handle(&mut h, query());

        let err = result.err().unwrap();
        assert_eq!(err.client_view(), (code::AUTHORIZATION, "Authorization error"));
        assert!(rx.try_recv().is_err());
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn engine_failure_reveals_its_text() {
        let engine = Arc::new(FakeEngine {
            fail_with: Some("no such table: t".to_string()),
            ..FakeEngine::default()
        });
        let mut h = handler(&engine, ROOT_USER, AccessPolicy::default());
        let (result, _stream, _rx) = handle(&mut h, query());
        assert_eq!(
            result.err().unwrap().client_view(),
            (code::INTERNAL, "no such table: t")
        );
    }

    #[test]
    fn schema_query_is_open_to_any_key_by_default() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, "u1", AccessPolicy::default());
        let (result, stream, _rx) = handle(
            &mut h,
            Message::SchemaQuery {
                scope: SchemaScope::View,
                name: Some("v".to_string()),
            },
        );
        assert!(result.is_ok());
        assert!(stream.is_closed());
        assert_eq!(engine.calls(), vec!["view v"]);
    }

    #[test]
    fn schema_query_can_require_root() {
        let engine = Arc::new(FakeEngine::default());
        let policy = AccessPolicy {
            schema_requires_root: true,
        };
        let mut h = handler(&engine, "u1", policy);
        let (result, _stream, _rx) = handle(
            &mut h,
            Message::SchemaQuery {
                scope: SchemaScope::All,
                name: None,
            },
        );
        assert_eq!(result.err().unwrap().client_view().0, code::AUTHORIZATION);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn create_db_is_unsupported_for_everyone() {
        let engine = Arc::new(FakeEngine::default());
        for key in [ROOT_USER, "u1"] {
            let mut h = handler(&engine, key, AccessPolicy::default());
            let (result, _stream, _rx) = handle(
                &mut h,
                Message::CreateDb {
                    name: "x".to_string(),
                },
            );
            assert_eq!(result.err().unwrap().client_view().0, code::UNSUPPORTED);
        }
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn create_user_registers_and_returns_credentials() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, ROOT_USER, AccessPolicy::default());
        let (result, stream, mut rx) = handle(&mut h, Message::CreateUser);
        assert!(result.is_ok());

        let (access_key, private_key) =
            match Message::decode(rx.try_recv().unwrap().payload).unwrap() {
                Message::Credentials {
                    access_key,
                    private_key,
                } => (access_key, private_key),
                other => panic!("expected credentials, got {other:?}"),
            };
        assert_eq!(access_key.len(), 20);
        assert_eq!(private_key.len(), 32);
        assert_eq!(rx.try_recv().unwrap().kind, FrameKind::Close);
        assert!(stream.is_closed());

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with(&format!("create-user {access_key} ")));
    }

    #[test]
    fn create_user_requires_root() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, "u1", AccessPolicy::default());
        let (result, _stream, _rx) = handle(&mut h, Message::CreateUser);
        assert_eq!(result.err().unwrap().client_view().0, code::AUTHORIZATION);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn tail_and_push_failures_are_coded() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, "u1", AccessPolicy::default());

        let (result, _stream, _rx) = handle(
            &mut h,
            Message::RequestTail {
                table: "t".to_string(),
                since: 0,
                filter_expr: None,
            },
        );
        assert_eq!(
            result.err().unwrap().client_view(),
            (code::INTERNAL, "no such table")
        );

        let (result, _stream, _rx) = handle(
            &mut h,
            Message::PushPromise {
                table: "t".to_string(),
            },
        );
        assert_eq!(
            result.err().unwrap().client_view(),
            (code::INTERNAL, "Internal error")
        );
    }

    #[test]
    fn data_and_stray_credentials_are_unexpected() {
        let engine = Arc::new(FakeEngine::default());
        let mut h = handler(&engine, ROOT_USER, AccessPolicy::default());

        let (result, _stream, _rx) = handle(&mut h, Message::data("x", true));
        assert_eq!(
            result.err().unwrap().client_view(),
            (
                code::UNEXPECTED_MESSAGE,
                "unexpected data on non-established connection"
            )
        );

        let (result, _stream, _rx) = handle(
            &mut h,
            Message::Credentials {
                access_key: "k".to_string(),
                private_key: vec![1].into(),
            },
        );
        assert_eq!(
            result.err().unwrap().client_view(),
            (code::UNEXPECTED_MESSAGE, "unexpected message")
        );
    }
}
