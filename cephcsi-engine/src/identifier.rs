//! Volume and snapshot handle codec.
//!
//! Every identifier handed to an orchestrator is the encoding of
//! `(version, cluster id, pool id, object UUID)`. The cluster id is
//! length-prefixed so that ids containing the field delimiter stay
//! unambiguous, and the object UUID is always the trailing 36 characters of
//! the handle (the journal's reverse-lookup path relies on this).

use std::fmt;

use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Current encoding version. Decoding rejects anything newer.
pub const IDENTIFIER_VERSION: u16 = 1;

/// A decoded volume, snapshot or group handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiIdentifier {
    /// Encoding version.
    pub version: u16,
    /// Cluster the object lives in, resolvable through the cluster registry.
    pub cluster_id: String,
    /// Numeric id of the backing pool at encode time.
    pub location_id: i64,
    /// UUID allocated by the journal for this object.
    pub object_uuid: Uuid,
}

impl CsiIdentifier {
    /// Compose a current-version identifier.
    pub fn new(cluster_id: impl Into<String>, location_id: i64, object_uuid: Uuid) -> Self {
        Self {
            version: IDENTIFIER_VERSION,
            cluster_id: cluster_id.into(),
            location_id,
            object_uuid,
        }
    }

    /// Encode into the opaque wire form
    /// `v<version>-<len>-<clusterID>-<locationID>-<uuid>`.
    pub fn encode(&self) -> String {
        format!(
            "v{}-{}-{}-{}-{}",
            self.version,
            self.cluster_id.len(),
            self.cluster_id,
            self.location_id,
            self.object_uuid
        )
    }

    /// Decode a wire identifier, rejecting unknown versions, malformed
    /// length prefixes and non-canonical trailing UUIDs.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bad = |reason: &str| {
            EngineError::BadIdentifier(format!("{encoded:?}: {reason}"))
        };

        let rest = encoded
            .strip_prefix('v')
            .ok_or_else(|| bad("missing version prefix"))?;

        let (version_str, rest) = rest
            .split_once('-')
            .ok_or_else(|| bad("missing version delimiter"))?;
        let version: u16 = version_str
            .parse()
            .map_err(|_| bad("malformed version"))?;
        if version == 0 || version > IDENTIFIER_VERSION {
            return Err(bad(&format!("unknown version {version}")));
        }

        let (len_str, rest) = rest
            .split_once('-')
            .ok_or_else(|| bad("missing length delimiter"))?;
        let cluster_len: usize = len_str
            .parse()
            .map_err(|_| bad("malformed length prefix"))?;
        if rest.len() < cluster_len + 1 || !rest.is_char_boundary(cluster_len) {
            return Err(bad("length prefix exceeds identifier"));
        }

        let cluster_id = &rest[..cluster_len];
        let rest = rest[cluster_len..]
            .strip_prefix('-')
            .ok_or_else(|| bad("missing cluster delimiter"))?;

        // The location id may itself be negative, so the split anchors on
        // the trailing 36-character UUID instead of the delimiter.
        if rest.len() < 38 || !rest.is_char_boundary(rest.len() - 37) {
            return Err(bad("missing location id or uuid"));
        }
        let (loc_str, uuid_part) = rest.split_at(rest.len() - 37);
        let uuid_str = uuid_part
            .strip_prefix('-')
            .ok_or_else(|| bad("missing uuid delimiter"))?;
        let location_id: i64 = loc_str
            .parse()
            .map_err(|_| bad("malformed location id"))?;

        let object_uuid = Uuid::parse_str(uuid_str)
            .map_err(|_| bad("trailing UUID is not canonical"))?;

        Ok(Self {
            version,
            cluster_id: cluster_id.to_string(),
            location_id,
            object_uuid,
        })
    }
}

impl fmt::Display for CsiIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_uuid() -> Uuid {
        Uuid::parse_str("00000000-0000-4000-8000-000000000001").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let id = CsiIdentifier::new("cluster-xyz", 42, sample_uuid());
        let encoded = id.encode();
        assert_eq!(
            encoded,
            "v1-11-cluster-xyz-42-00000000-0000-4000-8000-000000000001"
        );
        assert_eq!(CsiIdentifier::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn test_round_trip_with_delimiter_in_cluster_id() {
        // A cluster id containing the delimiter must survive because of the
        // length prefix.
        let id = CsiIdentifier::new("a-b-c", 7, sample_uuid());
        assert_eq!(CsiIdentifier::decode(&id.encode()).unwrap(), id);
    }

    #[test]
    fn test_round_trip_negative_location() {
        let id = CsiIdentifier::new("c1", -3, sample_uuid());
        assert_eq!(CsiIdentifier::decode(&id.encode()).unwrap(), id);
    }

    #[test]
    fn test_trailing_uuid_invariant() {
        let id = CsiIdentifier::new("c1", 1, sample_uuid());
        let encoded = id.encode();
        let tail = &encoded[encoded.len() - 36..];
        assert_eq!(Uuid::parse_str(tail).unwrap(), sample_uuid());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let encoded = format!("v99-2-c1-42-{}", sample_uuid());
        assert!(matches!(
            CsiIdentifier::decode(&encoded),
            Err(EngineError::BadIdentifier(_))
        ));
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        let uuid = sample_uuid();
        for bad in [
            "".to_string(),
            "v1".to_string(),
            format!("1-2-c1-42-{uuid}"),
            format!("v1-x-c1-42-{uuid}"),
            format!("v1-999-c1-42-{uuid}"),
            "v1-2-c1-42-not-a-uuid".to_string(),
            format!("v1-2-c1-42-{}", &uuid.to_string()[..35]),
            format!("v1-2-c1-nan-{uuid}"),
        ] {
            assert!(
                matches!(
                    CsiIdentifier::decode(&bad),
                    Err(EngineError::BadIdentifier(_))
                ),
                "expected decode failure for {bad:?}"
            );
        }
    }
}
