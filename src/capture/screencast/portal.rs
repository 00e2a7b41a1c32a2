//! Desktop portal handshake: CreateSession, SelectSources, Start, then
//! OpenPipeWireRemote for the media-bus descriptor.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use zbus::zvariant::{self, DeserializeDict, ObjectPath, OwnedObjectPath, OwnedValue, Type, Value};
use zbus::{Connection, Proxy};

use crate::error::RpcError;

const DESTINATION: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST: &str = "org.freedesktop.portal.ScreenCast";
const REQUEST: &str = "org.freedesktop.portal.Request";
const SESSION: &str = "org.freedesktop.portal.Session";

/// `types` bit for whole monitors.
const SOURCE_MONITOR: u32 = 1;

type Options<'a> = HashMap<&'static str, Value<'a>>;

/// `(node_id, properties)` entry of the Start response.
#[derive(Debug, Deserialize, Type)]
pub struct PortalStream(pub u32, pub HashMap<String, OwnedValue>);

#[derive(Debug, DeserializeDict, Type)]
#[zvariant(signature = "dict")]
struct StartResults {
    streams: Option<Vec<PortalStream>>,
}

pub struct PortalSession {
    conn: Connection,
    screencast: Proxy<'static>,
    /// Unique bus name in the form used by request object paths.
    sender: String,
    session: Option<OwnedObjectPath>,
    requests: u32,
}

impl PortalSession {
    pub async fn connect() -> Result<Self, RpcError> {
        let conn = Connection::session().await?;
        let sender = conn
            .unique_name()
            .map(|name| request_sender(name.as_str()))
            .ok_or(RpcError::Aborted)?;
        let screencast = Proxy::new(&conn, DESTINATION, PORTAL_PATH, SCREENCAST).await?;
        debug!("Connected to session bus as {}", sender);
        Ok(Self {
            conn,
            screencast,
            sender,
            session: None,
            requests: 0,
        })
    }

    /// Run the handshake up to Start and return the first stream's node id.
    #[instrument(skip(self))]
    pub async fn negotiate(&mut self) -> Result<u32, RpcError> {
        self.create_session().await?;
        self.select_sources().await?;
        self.start().await
    }

    fn next_token(&mut self) -> String {
        self.requests += 1;
        format!("visor_{}_{}", std::process::id(), self.requests)
    }

    /// Subscribe to the request object's Response, issue the call, then wait
    /// for the answer. Subscribing first means a fast portal cannot answer
    /// before we listen.
    async fn request<R>(&self, step: &'static str, token: &str, body: impl serde::Serialize + zvariant::DynamicType) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Type,
    {
        let expected = ObjectPath::try_from(format!("{}/request/{}/{}", PORTAL_PATH, self.sender, token))?;
        let request = Proxy::new(&self.conn, DESTINATION, expected.clone(), REQUEST).await?;
        let mut responses = request.receive_signal("Response").await?;

        let returned: OwnedObjectPath = self.screencast.call(step, &body).await?;
        if returned.as_str() != expected.as_str() {
            // Portals older than 0.9 ignore handle_token.
            warn!("{}: portal answered on {} instead of {}", step, returned.as_str(), expected.as_str());
            let request = Proxy::new(&self.conn, DESTINATION, returned.as_str(), REQUEST).await?;
            responses = request.receive_signal("Response").await?;
        }

        let message = responses.next().await.ok_or(RpcError::Aborted)?;
        let (code, results): (u32, R) = message.body().deserialize()?;
        if code != 0 {
            return Err(RpcError::Rejected { step, code });
        }
        debug!("{} accepted", step);
        Ok(results)
    }

    async fn create_session(&mut self) -> Result<(), RpcError> {
        let token = self.next_token();
        let mut options = Options::new();
        options.insert("handle_token", Value::from(token.as_str()));
        options.insert("session_handle_token", Value::from(token.as_str()));

        let results: HashMap<String, OwnedValue> =
            self.request("CreateSession", &token, (options,)).await?;
        let handle = session_handle(&results)?;
        info!("Portal session {}", handle.as_str());
        self.session = Some(handle);
        Ok(())
    }

    fn session(&self) -> Result<OwnedObjectPath, RpcError> {
        self.session.clone().ok_or(RpcError::Aborted)
    }

    async fn select_sources(&mut self) -> Result<(), RpcError> {
        let session = self.session()?;
        let token = self.next_token();
        let mut options = Options::new();
        options.insert("handle_token", Value::from(token.as_str()));
        options.insert("types", Value::from(SOURCE_MONITOR));
        options.insert("multiple", Value::from(false));

        let _: HashMap<String, OwnedValue> =
            self.request("SelectSources", &token, (session, options)).await?;
        Ok(())
    }

    async fn start(&mut self) -> Result<u32, RpcError> {
        let session = self.session()?;
        let token = self.next_token();
        let mut options = Options::new();
        options.insert("handle_token", Value::from(token.as_str()));

        let results: StartResults = self.request("Start", &token, (session, "", options)).await?;
        let PortalStream(node_id, properties) = results
            .streams
            .and_then(|streams| streams.into_iter().next())
            .ok_or(RpcError::MissingKey {
                step: "Start",
                key: "streams",
            })?;
        debug!("Stream properties: {:?}", properties.keys().collect::<Vec<_>>());
        Ok(node_id)
    }

    /// Descriptor for the PipeWire connection that carries the stream.
    pub async fn open_pipewire_remote(&self) -> Result<OwnedFd, RpcError> {
        let session = self.session()?;
        let fd: zvariant::OwnedFd = self
            .screencast
            .call("OpenPipeWireRemote", &(session, Options::new()))
            .await?;
        Ok(fd.into())
    }

    /// Close the portal session, if one was created.
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let closed = async {
            Proxy::new(&self.conn, DESTINATION, session.as_str(), SESSION)
                .await?
                .call_method("Close", &())
                .await
        }
        .await;
        match closed {
            Ok(_) => info!("Portal session closed"),
            Err(e) => warn!("closing portal session failed: {}", e),
        }
    }
}

/// `:1.42` becomes `1_42`.
fn request_sender(unique_name: &str) -> String {
    unique_name.trim_start_matches(':').replace('.', "_")
}

/// Portals disagree on key and type for the session handle; accept any of
/// the spellings seen in the wild, as a string or an object path.
fn session_handle(results: &HashMap<String, OwnedValue>) -> Result<OwnedObjectPath, RpcError> {
    for key in ["session_handle", "session", "handle"] {
        match results.get(key).map(|value| &**value) {
            Some(Value::Str(s)) => return Ok(ObjectPath::try_from(s.as_str())?.into()),
            Some(Value::ObjectPath(path)) => return Ok(path.clone().into()),
            _ => {}
        }
    }
    Err(RpcError::MissingKey {
        step: "CreateSession",
        key: "session_handle",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(value: Value<'static>) -> OwnedValue {
        value.try_into().unwrap()
    }

    #[test]
    fn test_request_sender() {
        assert_eq!(request_sender(":1.42"), "1_42");
    }

    #[test]
    fn test_session_handle_as_string() {
        let mut results = HashMap::new();
        results.insert(
            "session_handle".to_owned(),
            owned(Value::from("/org/freedesktop/portal/desktop/session/1_42/visor")),
        );
        let handle = session_handle(&results).unwrap();
        assert_eq!(handle.as_str(), "/org/freedesktop/portal/desktop/session/1_42/visor");
    }

    #[test]
    fn test_session_handle_alternate_key() {
        let path = ObjectPath::try_from("/org/freedesktop/portal/desktop/session/1_7/x").unwrap();
        let mut results = HashMap::new();
        results.insert("handle".to_owned(), owned(Value::from(path)));
        assert!(session_handle(&results).is_ok());
    }

    #[test]
    fn test_session_handle_missing() {
        let mut results = HashMap::new();
        results.insert("session_handle".to_owned(), owned(Value::from(7u32)));
        assert!(matches!(
            session_handle(&results),
            Err(RpcError::MissingKey { key: "session_handle", .. })
        ));
    }
}
