//! Newline-delimited JSON protocol.
//!
//! Every request is one JSON object on one line, tagged by `"op"`. Every
//! response is one line: `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{...}}`. Responses come back in request order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::auth::AdminAuth;
use crate::engine::{Caller, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::Ms;
use crate::observability;
use crate::request::{RawAddServices, RawCreateBooking, RawReschedule, RawUpdateStatus, parse_date};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Authenticate { token: String },
    AvailableSlots { date: String, duration_minutes: i64 },
    CreateBooking(RawCreateBooking),
    RescheduleBooking(RawReschedule),
    AddServices(RawAddServices),
    UpdateStatus(RawUpdateStatus),
    DeleteBooking { booking_id: Ulid },
    GetBooking { booking_id: Ulid },
    ListBookings { date: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub status: u16,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<Ms>,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            status: e.status_code(),
            retryable: e.is_retryable(),
            retry_after_ms: e.retry_after_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(e: &EngineError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(e.into()),
        }
    }
}

fn to_data(value: impl Serialize) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::PersistenceFailure(format!("encoding response: {e}")))
}

/// Run one request against the engine. `caller` is per-connection state:
/// a successful `authenticate` makes it privileged for the rest of the session.
/// Repeated bad tokens from one peer lock that peer out.
pub async fn dispatch(
    engine: &Engine,
    auth: &AdminAuth,
    caller: &mut Caller,
    req: Request,
) -> Result<Value, EngineError> {
    match req {
        Request::Authenticate { token } => {
            engine.authorize_admin(caller, || auth.verify(&token))?;
            caller.privileged = true;
            Ok(json!({ "privileged": true }))
        }
        Request::AvailableSlots { date, duration_minutes } => {
            let date = parse_date("date", &date)?;
            to_data(engine.available_slots(date, duration_minutes).await?)
        }
        Request::CreateBooking(raw) => {
            let cmd = raw.validate()?;
            to_data(engine.create_booking(caller, cmd).await?)
        }
        Request::RescheduleBooking(raw) => {
            let cmd = raw.validate()?;
            to_data(engine.reschedule_booking(caller, cmd).await?)
        }
        Request::AddServices(raw) => {
            let cmd = raw.validate()?;
            to_data(engine.add_services(caller, cmd).await?)
        }
        Request::UpdateStatus(raw) => {
            let cmd = raw.validate()?;
            to_data(engine.update_status(caller, cmd).await?)
        }
        Request::DeleteBooking { booking_id } => {
            engine.delete_booking(caller, booking_id).await?;
            Ok(json!({ "deleted": booking_id }))
        }
        Request::GetBooking { booking_id } => to_data(engine.get_booking(booking_id).await?),
        Request::ListBookings { date } => {
            if !caller.privileged {
                return Err(EngineError::Forbidden("listing bookings requires a privileged connection"));
            }
            let date = parse_date("date", &date)?;
            to_data(engine.list_bookings(date).await)
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length limit exceeded")
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(
    stream: S,
    peer: Option<SocketAddr>,
    engine: Arc<Engine>,
    auth: Arc<AdminAuth>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut caller = Caller::public(peer.map(|p| p.ip()));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let resp = Response::failure(&EngineError::LimitExceeded("request line too long"));
                framed.send(encode(&resp)).await.map_err(codec_err)?;
                continue;
            }
            Err(e) => return Err(codec_err(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let start = Instant::now();
        let (op, result) = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let op = observability::op_label(&req);
                debug!("{op} from {}", caller.rate_key());
                (op, dispatch(&engine, &auth, &mut caller, req).await)
            }
            Err(e) => ("malformed", Err(EngineError::invalid("request", e.to_string()))),
        };

        let resp = match result {
            Ok(data) => Response::success(data),
            Err(e) => Response::failure(&e),
        };
        let status = if resp.ok { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());

        framed.send(encode(&resp)).await.map_err(codec_err)?;
    }
    Ok(())
}

fn encode(resp: &Response) -> String {
    serde_json::to_string(resp).unwrap_or_else(|e| {
        format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"{e}","status":500,"retryable":false}}}}"#)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_requests() {
        let req: Request =
            serde_json::from_str(r#"{"op":"available_slots","date":"2030-01-08","duration_minutes":60}"#).unwrap();
        assert!(matches!(req, Request::AvailableSlots { duration_minutes: 60, .. }));
        assert_eq!(observability::op_label(&req), "available_slots");

        let id = Ulid::new();
        let req: Request = serde_json::from_str(&format!(r#"{{"op":"get_booking","booking_id":"{id}"}}"#)).unwrap();
        assert!(matches!(req, Request::GetBooking { booking_id } if booking_id == id));

        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_tables"}"#).is_err());
    }

    #[test]
    fn error_envelope_shape() {
        let resp = Response::failure(&EngineError::RateLimited { retry_after_ms: 900 });
        let v: Value = serde_json::from_str(&encode(&resp)).unwrap();
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["kind"], json!("rate_limited"));
        assert_eq!(v["error"]["status"], json!(429));
        assert_eq!(v["error"]["retryable"], json!(true));
        assert_eq!(v["error"]["retry_after_ms"], json!(900));
        assert!(v.get("data").is_none());
    }

    #[test]
    fn success_envelope_omits_error() {
        let v: Value = serde_json::from_str(&encode(&Response::success(json!({"x": 1})))).unwrap();
        assert_eq!(v, json!({"ok": true, "data": {"x": 1}}));
    }
}
