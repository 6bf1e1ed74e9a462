//! Inbound control-frame parsing.
//!
//! Control frames carry free-form JSON. Dispatch happens on the optional
//! `type` discriminator: `"assets"` requests, explicit `"conn"` teardown, or
//! a code submission identified by the presence of `projectId`. Anything else
//! is skipped.

use serde::Deserialize;

use crate::{AppError, Result};

/// Raw fields of an inbound control message.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlMessage {
    /// Discriminator (`"assets"`, `"conn"`, or absent for submissions).
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    /// Sub-operation for `"conn"` messages (`"close"`).
    pub handle: Option<String>,
    /// Project identifier; doubles as the working-directory key.
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    /// Submitted program source.
    pub xml: Option<String>,
    /// Opaque client session info carried on first contact.
    pub cookies: Option<String>,
    /// Everything else, kept for the asset provider descriptor.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A classified inbound control message.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// `type == "assets"` — forwarded to the asset provider.
    Assets(ControlMessage),
    /// `type == "conn", handle == "close"` — explicit client teardown.
    CloseSession,
    /// Carries a `projectId` — a code submission.
    Submission(ControlMessage),
    /// Recognized JSON but nothing actionable.
    Ignored,
}

/// Parse a control-frame payload into a [`ControlRequest`].
///
/// # Errors
///
/// Returns [`AppError::Session`] when the payload is not valid JSON. The
/// caller logs and drops such frames.
pub fn parse_control(payload: &str) -> Result<ControlRequest> {
    let msg: ControlMessage = serde_json::from_str(payload)
        .map_err(|err| AppError::Session(format!("malformed control frame: {err}")))?;

    match msg.msg_type.as_deref() {
        Some("assets") => Ok(ControlRequest::Assets(msg)),
        Some("conn") => {
            if msg.handle.as_deref() == Some("close") {
                Ok(ControlRequest::CloseSession)
            } else {
                Ok(ControlRequest::Ignored)
            }
        }
        _ => {
            if msg.project_id.is_some() {
                Ok(ControlRequest::Submission(msg))
            } else {
                Ok(ControlRequest::Ignored)
            }
        }
    }
}

impl ControlMessage {
    /// Rebuild the full JSON descriptor for the asset provider.
    #[must_use]
    pub fn descriptor(&self) -> serde_json::Value {
        let mut map = self.extra.clone();
        if let Some(pid) = &self.project_id {
            map.insert("projectId".into(), serde_json::Value::String(pid.clone()));
        }
        if let Some(xml) = &self.xml {
            map.insert("xml".into(), serde_json::Value::String(xml.clone()));
        }
        serde_json::Value::Object(map)
    }
}
