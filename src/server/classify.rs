//! Connection classification from the upgrade request's query string.

use crate::protocol::{CLOSE_MISSING_ID, OBSERVER_TYPE, PARAM_CLIENT_ID, PARAM_TYPE};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Dashboard connection receiving broadcast events.
    Observer,
    /// Remote agent receiving commands.
    Agent { identifier: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing client_id")]
    MissingIdentifier,
}

impl Rejection {
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::MissingIdentifier => CLOSE_MISSING_ID,
        }
    }
}

/// Classify a connection from its (undecoded) query string.
///
/// `type=web` marks an observer; anything else must carry a non-empty
/// `client_id`.
pub fn classify(query: Option<&str>) -> Result<ConnectionKind, Rejection> {
    let mut kind = None;
    let mut identifier = None;

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            PARAM_TYPE if kind.is_none() => kind = Some(value.into_owned()),
            PARAM_CLIENT_ID if identifier.is_none() => identifier = Some(value.into_owned()),
            _ => {}
        }
    }

    if kind.as_deref() == Some(OBSERVER_TYPE) {
        return Ok(ConnectionKind::Observer);
    }

    match identifier {
        Some(identifier) if !identifier.is_empty() => Ok(ConnectionKind::Agent { identifier }),
        _ => Err(Rejection::MissingIdentifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer() {
        assert_eq!(classify(Some("type=web")), Ok(ConnectionKind::Observer));
        assert_eq!(
            classify(Some("type=web&client_id=alpha")),
            Ok(ConnectionKind::Observer)
        );
    }

    #[test]
    fn test_agent() {
        assert_eq!(
            classify(Some("client_id=alpha")),
            Ok(ConnectionKind::Agent {
                identifier: "alpha".into()
            })
        );
        assert_eq!(
            classify(Some("type=client&client_id=host%20one")),
            Ok(ConnectionKind::Agent {
                identifier: "host one".into()
            })
        );
    }

    #[test]
    fn test_missing_identifier() {
        assert_eq!(classify(None), Err(Rejection::MissingIdentifier));
        assert_eq!(classify(Some("client_id=")), Err(Rejection::MissingIdentifier));
        assert_eq!(classify(Some("type=client")), Err(Rejection::MissingIdentifier));
        assert_eq!(Rejection::MissingIdentifier.close_code(), 4000);
    }
}
