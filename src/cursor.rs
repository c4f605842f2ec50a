//! Continuation tokens.
//!
//! A token is the query that produced a page plus the offset of the next
//! page, serialized as versioned JSON and encoded as URL-safe base64. The
//! engine keeps no per-query state: re-issuing the query with a token
//! recomputes the ranking and slices it at the stored offset.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

const TOKEN_VERSION: u8 = 1;

/// The query half of a token, compared against the request it comes with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorQuery {
    Chunks {
        concepts: Vec<String>,
        terms: Vec<String>,
    },
    Documents {
        query: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub v: u8,
    pub folder: String,
    pub query: CursorQuery,
    pub offset: usize,
}

impl Cursor {
    pub fn new(folder: impl Into<String>, query: CursorQuery, offset: usize) -> Self {
        Self {
            v: TOKEN_VERSION,
            folder: folder.into(),
            query,
            offset,
        }
    }

    pub fn encode(&self) -> String {
        // Serializing plain strings and integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| IndexError::InvalidQuery("malformed continuation token".into()))?;
        let cursor: Cursor = serde_json::from_slice(&bytes)
            .map_err(|_| IndexError::InvalidQuery("malformed continuation token".into()))?;
        if cursor.v != TOKEN_VERSION {
            return Err(IndexError::InvalidQuery(format!(
                "continuation token version {} is not supported",
                cursor.v
            )));
        }
        Ok(cursor)
    }

    /// Offset to resume from, if this token belongs to `folder` and `query`.
    pub fn resume(token: &str, folder: &str, query: &CursorQuery) -> Result<usize> {
        let cursor = Self::decode(token)?;
        if cursor.folder != folder || &cursor.query != query {
            return Err(IndexError::InvalidQuery(
                "continuation token was issued for a different query".into(),
            ));
        }
        Ok(cursor.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn chunks_query() -> CursorQuery {
        CursorQuery::Chunks {
            concepts: vec!["state management".into()],
            terms: vec!["useState".into()],
        }
    }

    #[test]
    fn token_is_url_safe() {
        let token = Cursor::new("/home/me/code", chunks_query(), 20).encode();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(Cursor::resume(&token, "/home/me/code", &chunks_query()).unwrap(), 20);
    }

    #[test]
    fn token_for_another_query_is_rejected() {
        let token = Cursor::new("/a", chunks_query(), 10).encode();
        let other = CursorQuery::Chunks {
            concepts: vec![],
            terms: vec!["useState".into()],
        };
        let err = Cursor::resume(&token, "/a", &other).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(Cursor::resume(&token, "/b", &chunks_query()).is_err());
    }

    #[test]
    fn garbage_is_invalid_query() {
        assert!(matches!(
            Cursor::decode("not a token!"),
            Err(IndexError::InvalidQuery(_))
        ));
        let wrong_version = URL_SAFE_NO_PAD.encode(
            br#"{"v":9,"folder":"/a","query":{"kind":"documents","query":"x"},"offset":0}"#,
        );
        assert!(Cursor::decode(&wrong_version).is_err());
    }
}
