use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockcount_core::{CountLineId, DomainError, DomainResult, Entity, SessionId};

/// Lifecycle state of a counting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// A stock-count session (one walk through a location).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSession {
    pub id: SessionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Entity for CountSession {
    type Id = SessionId;
    const KIND: &'static str = "session";

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl CountSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Fail if lines can no longer be recorded against this session.
    pub fn ensure_open(&self) -> DomainResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!("session {} is closed", self.id)))
        }
    }
}

/// One counted quantity of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountLine {
    pub id: CountLineId,
    pub session_id: SessionId,
    pub item_code: String,
    pub counted_qty: i64,
    pub counted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Entity for CountLine {
    type Id = CountLineId;
    const KIND: &'static str = "count_line";

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl CountLine {
    /// Cache key of the line list belonging to a session.
    pub fn list_key(session_id: &SessionId) -> String {
        format!("session_lines:{session_id}")
    }
}

/// A counted article that is not in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownItem {
    pub id: CountLineId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    pub description: String,
    pub counted_qty: i64,
    pub counted_at: DateTime<Utc>,
}

impl Entity for UnknownItem {
    type Id = CountLineId;
    const KIND: &'static str = "unknown_item";

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Input: open a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl NewSession {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("session name cannot be empty"));
        }
        Ok(())
    }

    /// Provisional local copy, used until the server's version is fetched.
    pub fn into_session(self, id: SessionId, now: DateTime<Utc>) -> CountSession {
        CountSession {
            id,
            name: self.name.trim().to_string(),
            location: self.location,
            status: SessionStatus::Open,
            created_at: now,
            closed_at: None,
        }
    }
}

/// Input: record a counted quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCountLine {
    pub session_id: SessionId,
    pub item_code: String,
    pub counted_qty: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl NewCountLine {
    pub fn validate(&self) -> DomainResult<()> {
        if self.item_code.trim().is_empty() {
            return Err(DomainError::validation("item_code cannot be empty"));
        }
        if self.counted_qty < 0 {
            return Err(DomainError::validation("counted_qty cannot be negative"));
        }
        Ok(())
    }

    pub fn into_line(self, id: CountLineId, now: DateTime<Utc>) -> CountLine {
        CountLine {
            id,
            session_id: self.session_id,
            item_code: crate::Item::normalize_code(&self.item_code),
            counted_qty: self.counted_qty,
            counted_at: now,
            note: self.note,
        }
    }
}

/// Input: record an article missing from the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnknownItem {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    pub description: String,
    pub counted_qty: i64,
}

impl NewUnknownItem {
    pub fn validate(&self) -> DomainResult<()> {
        let has_barcode = self.barcode.as_deref().is_some_and(|b| !b.trim().is_empty());
        if !has_barcode && self.description.trim().is_empty() {
            return Err(DomainError::validation(
                "unknown item needs a barcode or a description",
            ));
        }
        if self.counted_qty < 0 {
            return Err(DomainError::validation("counted_qty cannot be negative"));
        }
        Ok(())
    }

    pub fn into_unknown_item(self, id: CountLineId, now: DateTime<Utc>) -> UnknownItem {
        UnknownItem {
            id,
            session_id: self.session_id,
            barcode: self.barcode,
            description: self.description,
            counted_qty: self.counted_qty,
            counted_at: now,
        }
    }
}

/// Input: close a session so no more lines can be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSession {
    pub session_id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line(qty: i64, code: &str) -> NewCountLine {
        NewCountLine {
            session_id: SessionId::new(),
            item_code: code.to_string(),
            counted_qty: qty,
            note: None,
        }
    }

    #[test]
    fn empty_item_code_is_rejected() {
        let err = line(5, "  ").validate().unwrap_err();
        assert_eq!(err, DomainError::validation("item_code cannot be empty"));
    }

    #[test]
    fn closed_session_refuses_lines() {
        let mut session = NewSession {
            name: "Aisle 4".to_string(),
            location: None,
        }
        .into_session(SessionId::new(), Utc::now());
        assert!(session.ensure_open().is_ok());

        session.status = SessionStatus::Closed;
        assert!(matches!(
            session.ensure_open(),
            Err(DomainError::InvalidState(_))
        ));
    }

    #[test]
    fn into_line_normalizes_code() {
        let built = line(3, " x1 ").into_line(CountLineId::new(), Utc::now());
        assert_eq!(built.item_code, "X1");
        assert_eq!(built.counted_qty, 3);
    }

    #[test]
    fn unknown_item_needs_some_identification() {
        let input = NewUnknownItem {
            session_id: SessionId::new(),
            barcode: Some(" ".to_string()),
            description: String::new(),
            counted_qty: 1,
        };
        assert!(input.validate().is_err());

        let input = NewUnknownItem {
            barcode: Some("123".to_string()),
            ..input
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn session_status_serializes_lowercase() {
        let json = serde_json::to_value(SessionStatus::Closed).unwrap();
        assert_eq!(json, serde_json::json!("closed"));
    }

    proptest! {
        /// Property: validation accepts exactly the non-negative quantities.
        #[test]
        fn quantity_validation_matches_sign(qty in -1_000_000i64..1_000_000i64) {
            let result = line(qty, "X1").validate();
            prop_assert_eq!(result.is_ok(), qty >= 0);
        }
    }
}
