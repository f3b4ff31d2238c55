//! Wire records shared between the client API, the resource dispatch path,
//! and the callback endpoint. Field names follow the JSON contract
//! (camelCase) exactly.

use serde::{Deserialize, Serialize};

/// Server-generated opaque id linking a client request to its backend
/// callbacks and its event stream.
pub type CorrelationId = String;

/// Source identifier used on events the gateway synthesizes itself
/// (deadline shortfall, summary).
pub const AGGREGATOR_SOURCE: &str = "AGGREGATOR";

/// Outcome classification carried on every callback event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CONNECTION_CLOSED")]
    ConnectionClosed,
    #[serde(rename = "ERROR")]
    Error,
    /// Summary marker; valid only as the terminal event of a stream.
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl CallbackStatus {
    pub const fn wire_name(self) -> &'static str {
        match self {
            CallbackStatus::Ok => "ok",
            CallbackStatus::Rejected => "REJECTED",
            CallbackStatus::Timeout => "TIMEOUT",
            CallbackStatus::ConnectionClosed => "CONNECTION_CLOSED",
            CallbackStatus::Error => "ERROR",
            CallbackStatus::Complete => "COMPLETE",
        }
    }

    /// Technical failures count toward `errors`; `REJECTED` is a business
    /// outcome and counts toward neither respondents nor errors.
    pub fn is_technical_failure(self) -> bool {
        matches!(
            self,
            CallbackStatus::Timeout | CallbackStatus::ConnectionClosed | CallbackStatus::Error
        )
    }
}

/// A single journal entry returned by a resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalNote {
    pub date: String,
    pub note: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub caregiver_id: String,
}

/// One backend outcome, either posted by a resource on the callback
/// endpoint or synthesized by the gateway at dispatch/deadline time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalCallback {
    pub source: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<JournalNote>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respondents: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
}

impl JournalCallback {
    /// Status-only event standing in for a callback that will never arrive.
    pub fn synthetic(
        source: impl Into<String>,
        patient_id: Option<String>,
        correlation_id: CorrelationId,
        status: CallbackStatus,
    ) -> Self {
        Self {
            source: source.into(),
            patient_id,
            correlation_id: Some(correlation_id),
            status,
            notes: None,
            respondents: None,
            errors: None,
        }
    }

    /// Terminal event carrying the final tally; always reports both
    /// counters.
    pub fn summary(correlation_id: CorrelationId, respondents: u32, errors: u32) -> Self {
        Self {
            source: AGGREGATOR_SOURCE.to_string(),
            patient_id: None,
            correlation_id: Some(correlation_id),
            status: CallbackStatus::Complete,
            notes: None,
            respondents: Some(respondents),
            errors: Some(errors),
        }
    }
}

/// Aggregation strategy requested by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "SSE")]
    Sse,
    #[serde(rename = "WAIT_FOR_EVERYONE")]
    WaitForEveryone,
}

/// Body of `POST /aggregate/journals`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRequest {
    pub patient_id: String,
    #[serde(default)]
    pub delays: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

/// Immediate response for the streaming strategy; respondents is always 0
/// here, the real count arrives on the stream.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalResponse {
    pub respondents: u32,
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

/// Fully merged response for the WAIT_FOR_EVERYONE strategy.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedJournalResponse {
    pub patient_id: String,
    pub respondents: u32,
    pub errors: u32,
    pub notes: Vec<JournalNote>,
    pub correlation_id: CorrelationId,
    pub strategy: Strategy,
}

/// Fan-out command posted to `POST {resource}/journals`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalCommand {
    pub patient_id: String,
    pub delay: i64,
    pub callback_url: String,
    pub correlation_id: CorrelationId,
}

/// Body of the synchronous `POST {resource}/journals/direct` variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectJournalRequest {
    pub patient_id: String,
    pub delay: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallbackStatus::Ok).unwrap(),
            "\"ok\""
        );
        assert_eq!(
            serde_json::to_string(&CallbackStatus::ConnectionClosed).unwrap(),
            "\"CONNECTION_CLOSED\""
        );
        let parsed: CallbackStatus = serde_json::from_str("\"REJECTED\"").unwrap();
        assert_eq!(parsed, CallbackStatus::Rejected);
    }

    #[test]
    fn callback_roundtrip_with_notes() {
        let json = r#"{
            "source": "http://localhost:8081",
            "patientId": "19121212-1212",
            "correlationId": "abc",
            "status": "ok",
            "notes": [{
                "date": "2024-03-01",
                "note": "BP normal",
                "patientId": "19121212-1212",
                "doctorId": "doc-1",
                "caregiverId": "cg-1"
            }]
        }"#;

        let cb: JournalCallback = serde_json::from_str(json).unwrap();
        assert_eq!(cb.status, CallbackStatus::Ok);
        assert_eq!(cb.notes.as_ref().unwrap().len(), 1);
        assert_eq!(cb.notes.as_ref().unwrap()[0].doctor_id, "doc-1");
    }

    #[test]
    fn summary_carries_both_counters() {
        let summary = JournalCallback::summary("c-1".into(), 2, 1);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "COMPLETE");
        assert_eq!(json["respondents"], 2);
        assert_eq!(json["errors"], 1);
        assert_eq!(json["source"], AGGREGATOR_SOURCE);
        // Absent optionals are omitted, not serialized as null
        assert!(json.get("notes").is_none());
    }

    #[test]
    fn request_defaults() {
        let req: JournalRequest =
            serde_json::from_str(r#"{"patientId": "p1"}"#).unwrap();
        assert_eq!(req.patient_id, "p1");
        assert!(req.delays.is_none());
        assert!(req.timeout_ms.is_none());
        assert!(req.strategy.is_none());

        let req: JournalRequest = serde_json::from_str(
            r#"{"patientId": "p1", "delays": "0,0,-1", "timeoutMs": 5000, "strategy": "WAIT_FOR_EVERYONE"}"#,
        )
        .unwrap();
        assert_eq!(req.strategy, Some(Strategy::WaitForEveryone));
        assert_eq!(req.timeout_ms, Some(5000));
    }
}
