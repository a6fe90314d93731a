//! D-Bus transport for the screencast probe
//!
//! Speaks the request/response convention of the XDG Desktop Portal: every
//! ScreenCast method returns a Request object path, and the real result
//! arrives later as that object's `Response` signal. The subscription is
//! set up on the predictable request path *before* the method call so a
//! fast portal cannot answer into the void. Only the first `Response` per
//! request is consumed; duplicates die with the subscription.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;
use uuid::Uuid;
use zbus::{
    zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
    Connection,
};

use super::{PortFault, PortalResponse, ScreenCastPort};

const PORTAL_DESTINATION: &str = "org.freedesktop.portal.Desktop";
const PORTAL_PATH: &str = "/org/freedesktop/portal/desktop";
const SCREENCAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

/// SelectSources source type bitmask; the probe asks for monitors only
const SOURCE_TYPE_MONITOR: u32 = 1;

/// ScreenCast portal client for one probe run
pub struct PortalScreenCast {
    connection: Connection,
    proxy: zbus::Proxy<'static>,
    /// Our unique name mangled into the request path element
    sender_token: String,
}

impl PortalScreenCast {
    /// Build the ScreenCast proxy and capture our sender token for
    /// request path derivation
    pub async fn new(connection: &Connection) -> Result<Self> {
        let proxy: zbus::Proxy<'static> = zbus::ProxyBuilder::new(connection)
            .interface(SCREENCAST_INTERFACE)?
            .path(PORTAL_PATH)?
            .destination(PORTAL_DESTINATION)?
            .build()
            .await
            .context("Failed to create ScreenCast portal proxy")?;

        let sender_token = connection
            .unique_name()
            .map(|name| sender_path_token(name.as_str()))
            .ok_or_else(|| anyhow!("session bus connection has no unique name"))?;

        Ok(Self {
            connection: connection.clone(),
            proxy,
            sender_token,
        })
    }

    /// Call one ScreenCast method and wait for its Response signal.
    ///
    /// Returns the response code and results dict exactly as the portal
    /// sent them; response codes are the caller's business.
    async fn portal_request<B>(
        &self,
        method: &str,
        token: &str,
        body: &B,
    ) -> Result<(u32, HashMap<String, OwnedValue>), PortFault>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        let expected = request_path(&self.sender_token, token);
        let mut responses = self
            .response_stream(&expected)
            .await
            .map_err(PortFault::Transport)?;

        let reply = self
            .proxy
            .call_method(method, body)
            .await
            .with_context(|| format!("Failed to call portal {method}"))
            .map_err(PortFault::Transport)?;
        let handle: OwnedObjectPath = reply.body().deserialize().map_err(|e| {
            PortFault::Malformed(format!("{method} reply was not a request handle: {e}"))
        })?;

        // Portals predating predictable request paths hand back their own
        // handle. Moving the subscription can lose a response that fires
        // in between; the step timeout covers that loss.
        if handle.as_str() != expected {
            debug!(expected = %expected, actual = %handle, "re-subscribing on portal-chosen request path");
            responses = self
                .response_stream(handle.as_str())
                .await
                .map_err(PortFault::Transport)?;
        }

        let message = responses.next().await.ok_or_else(|| {
            PortFault::Transport(anyhow!("response stream closed before {method} completed"))
        })?;
        let (code, results) = message
            .body()
            .deserialize::<(u32, HashMap<String, OwnedValue>)>()
            .map_err(|e| PortFault::Malformed(format!("{method} Response body: {e}")))?;
        debug!(method, code, "portal responded");
        Ok((code, results))
    }

    /// Subscribe to the Response signal of one request object
    async fn response_stream(
        &self,
        request_path: &str,
    ) -> Result<impl futures_util::Stream<Item = zbus::Message>> {
        let path = ObjectPath::try_from(request_path.to_string())
            .context("Portal request handle is not a valid object path")?;
        let proxy: zbus::Proxy<'static> = zbus::ProxyBuilder::new(&self.connection)
            .interface(REQUEST_INTERFACE)?
            .path(path)?
            .destination(PORTAL_DESTINATION)?
            .build()
            .await
            .context("Failed to create portal Request proxy")?;
        proxy
            .receive_signal("Response")
            .await
            .context("Failed to subscribe to portal Response signal")
    }

    async fn close_session_inner(&self, session_handle: &str) -> Result<()> {
        let path = ObjectPath::try_from(session_handle.to_string())
            .context("Session handle is not a valid object path")?;
        let proxy: zbus::Proxy<'static> = zbus::ProxyBuilder::new(&self.connection)
            .interface(SESSION_INTERFACE)?
            .path(path)?
            .destination(PORTAL_DESTINATION)?
            .build()
            .await
            .context("Failed to create portal Session proxy")?;
        proxy
            .call_method("Close", &())
            .await
            .context("Failed to close portal session")?;
        Ok(())
    }
}

#[async_trait]
impl ScreenCastPort for PortalScreenCast {
    async fn create_session(&self) -> Result<PortalResponse, PortFault> {
        let token = fresh_token();
        let session_token = fresh_token();
        let options: HashMap<String, Value<'_>> = HashMap::from([
            ("handle_token".to_string(), Value::from(token.as_str())),
            (
                "session_handle_token".to_string(),
                Value::from(session_token.as_str()),
            ),
        ]);

        let (code, results) = self
            .portal_request("CreateSession", &token, &(options,))
            .await?;
        Ok(PortalResponse {
            code,
            session_handle: extract_session_handle(&results),
            streams: vec![],
        })
    }

    async fn select_sources(&self, session_handle: &str) -> Result<PortalResponse, PortFault> {
        let token = fresh_token();
        let session = ObjectPath::try_from(session_handle.to_string())
            .map_err(|e| PortFault::Malformed(format!("invalid session handle: {e}")))?;
        // Monitors only, single stream, no cursor options: the cheapest
        // selection the portal accepts without extra dialogs on most
        // backends.
        let options: HashMap<String, Value<'_>> = HashMap::from([
            ("handle_token".to_string(), Value::from(token.as_str())),
            ("types".to_string(), Value::from(SOURCE_TYPE_MONITOR)),
            ("multiple".to_string(), Value::from(false)),
        ]);

        let (code, _results) = self
            .portal_request("SelectSources", &token, &(session, options))
            .await?;
        Ok(PortalResponse {
            code,
            session_handle: None,
            streams: vec![],
        })
    }

    async fn start(&self, session_handle: &str) -> Result<PortalResponse, PortFault> {
        let token = fresh_token();
        let session = ObjectPath::try_from(session_handle.to_string())
            .map_err(|e| PortFault::Malformed(format!("invalid session handle: {e}")))?;
        let options: HashMap<String, Value<'_>> =
            HashMap::from([("handle_token".to_string(), Value::from(token.as_str()))]);

        // Empty parent window: the portal positions its own dialog
        let (code, results) = self
            .portal_request("Start", &token, &(session, "", options))
            .await?;
        Ok(PortalResponse {
            code,
            session_handle: None,
            streams: extract_stream_nodes(&results),
        })
    }

    async fn close_session(&self, session_handle: &str) {
        if let Err(e) = self.close_session_inner(session_handle).await {
            debug!(session = %session_handle, "portal session close failed: {e:#}");
        }
    }
}

/// Request object path the portal derives from our unique name and token
fn request_path(sender_token: &str, handle_token: &str) -> String {
    format!("/org/freedesktop/portal/desktop/request/{sender_token}/{handle_token}")
}

/// Unique name mangled per the Request interface convention: leading ':'
/// stripped, '.' replaced with '_'
fn sender_path_token(unique_name: &str) -> String {
    unique_name.trim_start_matches(':').replace('.', "_")
}

/// Handle tokens must be unique per request and valid as one path element
fn fresh_token() -> String {
    format!("lamcodoc{}", Uuid::new_v4().simple())
}

/// Pull the session handle out of CreateSession results. The portal sends
/// a string, though the value is semantically an object path; some
/// backends have shipped it as either type.
fn extract_session_handle(results: &HashMap<String, OwnedValue>) -> Option<String> {
    match &**results.get("session_handle")? {
        Value::Str(s) => Some(s.to_string()),
        Value::ObjectPath(p) => Some(p.to_string()),
        _ => None,
    }
}

/// Pull PipeWire node ids out of Start results. Streams arrive as
/// a(ua{sv}): node id first, properties we do not need second.
fn extract_stream_nodes(results: &HashMap<String, OwnedValue>) -> Vec<u32> {
    let Some(value) = results.get("streams") else {
        return Vec::new();
    };
    let Value::Array(streams) = &**value else {
        return Vec::new();
    };

    let mut nodes = Vec::new();
    for stream in streams.iter() {
        if let Value::Structure(fields) = stream {
            if let Some(Value::U32(node)) = fields.fields().first() {
                nodes.push(*node);
            }
        }
    }
    nodes
}
