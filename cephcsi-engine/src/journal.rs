//! Crash-safe request-name journal persisted in RADOS.
//!
//! Provisioning calls arrive with an orchestrator-chosen request name and
//! must be idempotent under retry. The journal maps each request name to an
//! allocated UUID (and backend name) through two kinds of objects:
//!
//! - a per-instance *directory* object whose OMap stores
//!   `<name key prefix><request name> -> <uuid>` forward pointers, and
//! - one *UUID object* per allocation whose OMap stores the reverse pointer
//!   (`csi.volname`), the backend name (`csi.imagename`) and auxiliary
//!   attributes.
//!
//! Create order is UUID object first, directory entry second; undo is the
//! reverse. A crash between the two steps leaks an inert UUID object but
//! never a dangling forward pointer.
//!
//! Three journals share this machinery with different prefixes: volumes,
//! snapshots and groups. Group journals additionally store arbitrary
//! `<member id> -> <value>` entries on their UUID objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::rados::{RadosIoCtx, StoreOp};

/// Reverse pointer: the request name this UUID was allocated for.
pub const ATTR_REQUEST_NAME: &str = "csi.volname";
/// Backend image/subvolume/group name.
pub const ATTR_IMAGE_NAME: &str = "csi.imagename";
/// Identifier of the clone/restore source, when there is one.
pub const ATTR_SOURCE: &str = "csi.source";
/// Marker that the volume carries encryption metadata.
pub const ATTR_ENCRYPTION: &str = "csi.encryption";
/// KMS configuration id for encrypted volumes.
pub const ATTR_KMS_KEY: &str = "csi.kmskey";
/// RFC 3339 creation timestamp.
pub const ATTR_CREATED_AT: &str = "csi.createdat";

const MAX_UUID_ATTEMPTS: usize = 5;

/// Data resolved from a journal hit.
#[derive(Debug, Clone)]
pub struct JournalData {
    pub object_uuid: Uuid,
    pub request_name: String,
    pub image_name: String,
    pub source_id: Option<String>,
    pub encrypted: bool,
    pub kms_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Request name, backend name and member map of a group reservation.
#[derive(Debug, Clone)]
pub struct GroupAttributes {
    pub request_name: String,
    pub group_name: String,
    pub members: BTreeMap<String, String>,
}

/// One journal instance (volumes, snapshots or groups).
///
/// Journals are parameterized by object-name prefixes plus the CSI instance
/// id suffix so several driver instances can share a cluster without
/// stepping on each other. Methods take the IO context explicitly; the
/// journal itself holds no connection state.
#[derive(Debug, Clone)]
pub struct Journal {
    /// Name of the directory object, e.g. `csi.volumes.default`.
    csi_directory: String,
    /// Prefix of forward-pointer keys in the directory OMap.
    csi_name_key_prefix: String,
    /// Prefix of UUID object names, e.g. `csi.volume.`.
    uuid_directory_prefix: String,
    /// Backend name prefix used when the request does not supply one.
    default_name_prefix: String,
}

fn instance_suffix(instance_id: &str) -> &str {
    if instance_id.is_empty() {
        "default"
    } else {
        instance_id
    }
}

impl Journal {
    /// The volume journal for a driver instance.
    pub fn volume(instance_id: &str) -> Self {
        Self {
            csi_directory: format!("csi.volumes.{}", instance_suffix(instance_id)),
            csi_name_key_prefix: "csi.volume.".to_string(),
            uuid_directory_prefix: "csi.volume.".to_string(),
            default_name_prefix: "csi-vol-".to_string(),
        }
    }

    /// The snapshot journal for a driver instance.
    pub fn snapshot(instance_id: &str) -> Self {
        Self {
            csi_directory: format!("csi.snaps.{}", instance_suffix(instance_id)),
            csi_name_key_prefix: "csi.snap.".to_string(),
            uuid_directory_prefix: "csi.snap.".to_string(),
            default_name_prefix: "csi-snap-".to_string(),
        }
    }

    /// The group journal for a driver instance.
    pub fn group(instance_id: &str) -> Self {
        Self {
            csi_directory: format!("csi.groups.{}", instance_suffix(instance_id)),
            csi_name_key_prefix: "csi.group.".to_string(),
            uuid_directory_prefix: "csi.volume.group.".to_string(),
            default_name_prefix: "csi-grp-".to_string(),
        }
    }

    fn directory_key(&self, request_name: &str) -> String {
        format!("{}{}", self.csi_name_key_prefix, request_name)
    }

    /// Object name of a UUID object.
    pub fn uuid_object(&self, uuid: &Uuid) -> String {
        format!("{}{}", self.uuid_directory_prefix, uuid)
    }

    /// Backend name for an allocation.
    pub fn backend_name(&self, name_prefix: Option<&str>, uuid: &Uuid) -> String {
        match name_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}{uuid}"),
            _ => format!("{}{}", self.default_name_prefix, uuid),
        }
    }

    /// Allocate a UUID and backend name for `request_name`.
    ///
    /// Callers must run [`Journal::check`] first; `reserve` never looks at
    /// existing forward pointers. A collision on the freshly rolled UUID is
    /// retried a bounded number of times; any failure after the UUID object
    /// exists triggers a best-effort undo before the error propagates.
    pub async fn reserve(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        request_name: &str,
        name_prefix: Option<&str>,
    ) -> Result<(Uuid, String)> {
        for _ in 0..MAX_UUID_ATTEMPTS {
            let uuid = Uuid::new_v4();
            let name = self.backend_name(name_prefix, &uuid);
            let oid = self.uuid_object(&uuid);

            let mut attrs = BTreeMap::new();
            attrs.insert(
                ATTR_REQUEST_NAME.to_string(),
                request_name.as_bytes().to_vec(),
            );
            attrs.insert(ATTR_IMAGE_NAME.to_string(), name.as_bytes().to_vec());
            attrs.insert(
                ATTR_CREATED_AT.to_string(),
                Utc::now().to_rfc3339().into_bytes(),
            );

            // Step one: the UUID object, created exclusively.
            match ioctx
                .apply(
                    &oid,
                    None,
                    vec![StoreOp::CreateExclusive, StoreOp::SetOmap(attrs)],
                )
                .await
            {
                Ok(()) => {}
                Err(EngineError::AlreadyExists(_)) => {
                    debug!(uuid = %uuid, "UUID collision during reserve, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            // Step two: the forward pointer in the directory object.
            let mut pointer = BTreeMap::new();
            pointer.insert(
                self.directory_key(request_name),
                uuid.to_string().into_bytes(),
            );
            match ioctx
                .apply(&self.csi_directory, None, vec![StoreOp::SetOmap(pointer)])
                .await
            {
                Ok(()) => {
                    info!(
                        request_name = %request_name,
                        uuid = %uuid,
                        name = %name,
                        directory = %self.csi_directory,
                        "Journal reservation committed"
                    );
                    return Ok((uuid, name));
                }
                Err(e) => {
                    warn!(
                        request_name = %request_name,
                        uuid = %uuid,
                        error = %e,
                        "Directory update failed after UUID creation, undoing"
                    );
                    self.undo(ioctx, &uuid, request_name).await.ok();
                    return Err(e);
                }
            }
        }

        Err(EngineError::Internal(format!(
            "exhausted {MAX_UUID_ATTEMPTS} UUID allocation attempts for {request_name}"
        )))
    }

    /// Look up a prior reservation for `request_name`.
    ///
    /// Absence is not an error: `Ok(None)` means the caller should reserve.
    /// A forward pointer whose UUID object is gone is a leak from a
    /// crashed undo; it is cleaned up here and reported as absent. A UUID
    /// object whose reverse pointer names a different request is never
    /// auto-repaired.
    pub async fn check(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        request_name: &str,
    ) -> Result<Option<JournalData>> {
        let dir_key = self.directory_key(request_name);
        let pointers = match ioctx.get_omap(&self.csi_directory, &[&dir_key]).await {
            Ok(pointers) => pointers,
            // No directory object yet: nothing was ever reserved here.
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let uuid_bytes = match pointers.get(&dir_key) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let uuid = Uuid::parse_str(String::from_utf8_lossy(uuid_bytes).trim()).map_err(|e| {
            EngineError::StateInconsistent(format!(
                "directory entry for {request_name} holds a malformed UUID: {e}"
            ))
        })?;

        let oid = self.uuid_object(&uuid);
        let attrs = match ioctx
            .get_omap(
                &oid,
                &[
                    ATTR_REQUEST_NAME,
                    ATTR_IMAGE_NAME,
                    ATTR_SOURCE,
                    ATTR_ENCRYPTION,
                    ATTR_KMS_KEY,
                    ATTR_CREATED_AT,
                ],
            )
            .await
        {
            Ok(attrs) => attrs,
            Err(EngineError::NotFound(_)) => {
                warn!(
                    request_name = %request_name,
                    uuid = %uuid,
                    "Stale forward pointer without UUID object, undoing"
                );
                self.undo(ioctx, &uuid, request_name).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let stored_request = attrs
            .get(ATTR_REQUEST_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default();
        if stored_request != request_name {
            return Err(EngineError::StateInconsistent(format!(
                "UUID object {oid} belongs to request {stored_request:?}, \
                 directory points at it from {request_name:?}"
            )));
        }

        let image_name = attrs
            .get(ATTR_IMAGE_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .ok_or_else(|| {
                EngineError::StateInconsistent(format!("UUID object {oid} has no backend name"))
            })?;

        Ok(Some(JournalData {
            object_uuid: uuid,
            request_name: stored_request,
            image_name,
            source_id: attrs
                .get(ATTR_SOURCE)
                .map(|v| String::from_utf8_lossy(v).to_string()),
            encrypted: attrs.contains_key(ATTR_ENCRYPTION),
            kms_id: attrs
                .get(ATTR_KMS_KEY)
                .map(|v| String::from_utf8_lossy(v).to_string()),
            created_at: attrs.get(ATTR_CREATED_AT).and_then(|v| {
                DateTime::parse_from_rfc3339(String::from_utf8_lossy(v).trim())
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }),
        }))
    }

    /// Read journal data for a known UUID, bypassing the directory.
    ///
    /// Used when a request carries an already-decoded identifier whose
    /// trailing UUID locates the object directly.
    pub async fn get_by_uuid(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
    ) -> Result<Option<JournalData>> {
        let oid = self.uuid_object(uuid);
        let attrs = match ioctx
            .get_omap(
                &oid,
                &[
                    ATTR_REQUEST_NAME,
                    ATTR_IMAGE_NAME,
                    ATTR_SOURCE,
                    ATTR_ENCRYPTION,
                    ATTR_KMS_KEY,
                    ATTR_CREATED_AT,
                ],
            )
            .await
        {
            Ok(attrs) => attrs,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let request_name = attrs
            .get(ATTR_REQUEST_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default();
        let image_name = attrs
            .get(ATTR_IMAGE_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .ok_or_else(|| {
                EngineError::StateInconsistent(format!("UUID object {oid} has no backend name"))
            })?;

        Ok(Some(JournalData {
            object_uuid: *uuid,
            request_name,
            image_name,
            source_id: attrs
                .get(ATTR_SOURCE)
                .map(|v| String::from_utf8_lossy(v).to_string()),
            encrypted: attrs.contains_key(ATTR_ENCRYPTION),
            kms_id: attrs
                .get(ATTR_KMS_KEY)
                .map(|v| String::from_utf8_lossy(v).to_string()),
            created_at: attrs.get(ATTR_CREATED_AT).and_then(|v| {
                DateTime::parse_from_rfc3339(String::from_utf8_lossy(v).trim())
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }),
        }))
    }

    /// Reverse of [`Journal::reserve`]: UUID object first, directory entry
    /// second. Idempotent; either piece may already be gone.
    pub async fn undo(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        request_name: &str,
    ) -> Result<()> {
        ioctx.remove(&self.uuid_object(uuid)).await?;

        // Dropping the forward pointer must not conjure up an empty
        // directory object.
        if ioctx.stat(&self.csi_directory).await?.is_some() {
            ioctx
                .apply(
                    &self.csi_directory,
                    None,
                    vec![StoreOp::RemoveOmapKeys(vec![
                        self.directory_key(request_name)
                    ])],
                )
                .await?;
        }
        debug!(
            request_name = %request_name,
            uuid = %uuid,
            "Journal reservation undone"
        );
        Ok(())
    }

    /// Set auxiliary attributes on a UUID object.
    pub async fn set_attributes(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        attributes: &[(&str, &str)],
    ) -> Result<()> {
        let entries: BTreeMap<String, Vec<u8>> = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        ioctx
            .apply(
                &self.uuid_object(uuid),
                None,
                vec![StoreOp::SetOmap(entries)],
            )
            .await
    }

    /// Read one attribute from a UUID object; `None` when the key or the
    /// object is absent.
    pub async fn get_attribute(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        key: &str,
    ) -> Result<Option<String>> {
        match ioctx.get_omap(&self.uuid_object(uuid), &[key]).await {
            Ok(entries) => Ok(entries
                .get(key)
                .map(|v| String::from_utf8_lossy(v).to_string())),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Group extension: record `<member id> -> <value>` entries.
    ///
    /// Group snapshots store the member snapshot id as the value; group
    /// replication stores an empty value.
    pub async fn add_volumes_mapping(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        mapping: &BTreeMap<String, String>,
    ) -> Result<()> {
        let entries: BTreeMap<String, Vec<u8>> = mapping
            .iter()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
            .collect();
        ioctx
            .apply(
                &self.uuid_object(uuid),
                None,
                vec![StoreOp::SetOmap(entries)],
            )
            .await
    }

    /// Group extension: drop member entries.
    pub async fn remove_volumes_mapping(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        members: &[String],
    ) -> Result<()> {
        ioctx
            .apply(
                &self.uuid_object(uuid),
                None,
                vec![StoreOp::RemoveOmapKeys(members.to_vec())],
            )
            .await
    }

    /// Group extension: request name, group name and member map.
    pub async fn get_volume_group_attributes(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
    ) -> Result<GroupAttributes> {
        let oid = self.uuid_object(uuid);
        let entries = ioctx.list_omap(&oid, "").await?;

        let request_name = entries
            .get(ATTR_REQUEST_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .ok_or_else(|| {
                EngineError::StateInconsistent(format!("group object {oid} has no request name"))
            })?;
        let group_name = entries
            .get(ATTR_IMAGE_NAME)
            .map(|v| String::from_utf8_lossy(v).to_string())
            .ok_or_else(|| {
                EngineError::StateInconsistent(format!("group object {oid} has no group name"))
            })?;

        // Everything outside the csi.* attribute namespace is a member
        // entry.
        let members = entries
            .iter()
            .filter(|(k, _)| !k.starts_with("csi."))
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).to_string()))
            .collect();

        Ok(GroupAttributes {
            request_name,
            group_name,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rados::{MemoryCluster, RadosCluster};

    async fn ioctx(cluster: &MemoryCluster) -> Arc<dyn RadosIoCtx> {
        cluster.io_ctx("rbd", "").await.unwrap()
    }

    #[tokio::test]
    async fn test_reserve_then_check_is_stable() {
        let cluster = MemoryCluster::new();
        let ioctx = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        let (uuid, name) = journal.reserve(&ioctx, "pvc-1", None).await.unwrap();
        assert_eq!(name, format!("csi-vol-{uuid}"));

        for _ in 0..10 {
            let data = journal.check(&ioctx, "pvc-1").await.unwrap().unwrap();
            assert_eq!(data.object_uuid, uuid);
            assert_eq!(data.image_name, name);
            assert_eq!(data.request_name, "pvc-1");
            assert!(data.created_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_check_misses_unknown_request() {
        let cluster = MemoryCluster::new();
        let ioctx = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        // No directory object at all.
        assert!(journal.check(&ioctx, "pvc-1").await.unwrap().is_none());

        // Directory exists, but the request was never reserved.
        journal.reserve(&ioctx, "pvc-other", None).await.unwrap();
        assert!(journal.check(&ioctx, "pvc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_name_prefix() {
        let cluster = MemoryCluster::new();
        let ioctx = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        let (uuid, name) = journal
            .reserve(&ioctx, "pvc-1", Some("tenant-a-"))
            .await
            .unwrap();
        assert_eq!(name, format!("tenant-a-{uuid}"));
    }

    #[tokio::test]
    async fn test_undo_removes_both_pieces() {
        let cluster = MemoryCluster::new();
        let ioctx = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        let (uuid, _) = journal.reserve(&ioctx, "pvc-1", None).await.unwrap();
        journal.undo(&ioctx, &uuid, "pvc-1").await.unwrap();

        assert!(!cluster.object_exists("rbd", "", &journal.uuid_object(&uuid)));
        assert!(journal.check(&ioctx, "pvc-1").await.unwrap().is_none());

        // Undo again: both pieces already gone, still fine.
        journal.undo(&ioctx, &uuid, "pvc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_between_steps_leaks_inert_uuid_object() {
        let cluster = MemoryCluster::new();
        let ioctx = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        // Simulate a crash after step one of reserve: the UUID object
        // exists, the directory entry does not.
        let uuid = Uuid::new_v4();
        let mut attrs = BTreeMap::new();
        attrs.insert(ATTR_REQUEST_NAME.to_string(), b"pvc-1".to_vec());
        attrs.insert(
            ATTR_IMAGE_NAME.to_string(),
            format!("csi-vol-{uuid}").into_bytes(),
        );
        ioctx
            .apply(
                &journal.uuid_object(&uuid),
                None,
                vec![StoreOp::CreateExclusive, StoreOp::SetOmap(attrs)],
            )
            .await
            .unwrap();

        // Recovery sees no reservation and reserves afresh.
        assert!(journal.check(&ioctx, "pvc-1").await.unwrap().is_none());
        let (new_uuid, _) = journal.reserve(&ioctx, "pvc-1", None).await.unwrap();
        assert_ne!(new_uuid, uuid);

        // The leaked object is still there, but nothing points at it.
        assert!(cluster.object_exists("rbd", "", &journal.uuid_object(&uuid)));
        let data = journal.check(&ioctx, "pvc-1").await.unwrap().unwrap();
        assert_eq!(data.object_uuid, new_uuid);
    }

    #[tokio::test]
    async fn test_stale_forward_pointer_is_cleaned_up() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        let (uuid, _) = journal.reserve(&io, "pvc-1", None).await.unwrap();
        // Simulate a crashed undo that removed the UUID object only.
        io.remove(&journal.uuid_object(&uuid)).await.unwrap();

        assert!(journal.check(&io, "pvc-1").await.unwrap().is_none());
        // The pointer itself was dropped by check.
        let (second, _) = journal.reserve(&io, "pvc-1", None).await.unwrap();
        assert_ne!(second, uuid);
    }

    #[tokio::test]
    async fn test_reverse_pointer_mismatch_is_inconsistent() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let journal = Journal::volume("i1");

        let (uuid, _) = journal.reserve(&io, "pvc-1", None).await.unwrap();

        // Corrupt the reverse pointer.
        journal
            .set_attributes(&io, &uuid, &[(ATTR_REQUEST_NAME, "pvc-other")])
            .await
            .unwrap();

        let err = journal.check(&io, "pvc-1").await.unwrap_err();
        assert!(matches!(err, EngineError::StateInconsistent(_)));
        // Not auto-repaired: the forward pointer survives.
        assert!(matches!(
            journal.check(&io, "pvc-1").await,
            Err(EngineError::StateInconsistent(_))
        ));
    }

    #[tokio::test]
    async fn test_journals_are_disjoint() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;

        let volumes = Journal::volume("i1");
        let snaps = Journal::snapshot("i1");

        volumes.reserve(&io, "pvc-1", None).await.unwrap();
        assert!(snaps.check(&io, "pvc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_mappings() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let journal = Journal::group("i1");

        let (uuid, name) = journal.reserve(&io, "group-1", None).await.unwrap();

        let mut mapping = BTreeMap::new();
        mapping.insert("vol-id-a".to_string(), "snap-id-a".to_string());
        mapping.insert("vol-id-b".to_string(), "snap-id-b".to_string());
        journal
            .add_volumes_mapping(&io, &uuid, &mapping)
            .await
            .unwrap();

        let attrs = journal.get_volume_group_attributes(&io, &uuid).await.unwrap();
        assert_eq!(attrs.request_name, "group-1");
        assert_eq!(attrs.group_name, name);
        assert_eq!(attrs.members, mapping);

        journal
            .remove_volumes_mapping(&io, &uuid, &["vol-id-a".to_string()])
            .await
            .unwrap();
        let attrs = journal.get_volume_group_attributes(&io, &uuid).await.unwrap();
        assert_eq!(attrs.members.len(), 1);
        assert!(attrs.members.contains_key("vol-id-b"));
    }
}
