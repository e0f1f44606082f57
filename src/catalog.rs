//! Snapshot catalog sourced from the volume binding

use crate::snapshot::Snapshot;
use crate::volume::VolumeBinding;
use crate::{Error, Result};
use tracing::debug;

/// Load the snapshots of `filesystem`, oldest first.
///
/// Every call asks the binding afresh; nothing is cached.
pub fn load(binding: &dyn VolumeBinding, filesystem: &str) -> Result<Vec<Snapshot>> {
    let infos = binding
        .list_snapshots(filesystem)
        .map_err(|source| Error::CatalogUnavailable {
            filesystem: filesystem.to_string(),
            source,
        })?;

    let mut snapshots: Vec<Snapshot> = infos
        .into_iter()
        .map(|info| Snapshot {
            filesystem: filesystem.to_string(),
            name: info.name,
            created: info.created,
            used_bytes: info.used_bytes,
        })
        .collect();
    snapshots.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));

    debug!("Loaded {} snapshots of {}", snapshots.len(), filesystem);
    Ok(snapshots)
}

/// Find a snapshot by name in a loaded catalog
pub fn find<'a>(snapshots: &'a [Snapshot], name: &str) -> Option<&'a Snapshot> {
    snapshots.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryVolume;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_load_orders_and_tags_filesystem() -> Result<()> {
        let vol = MemoryVolume::new();
        let t = |d| Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap();
        vol.add_snapshot("tank/a", "2024-05-02", t(2), 10);
        vol.add_snapshot("tank/a", "2024-05-01", t(1), 20);

        let snaps = load(&vol, "tank/a")?;
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].name, "2024-05-01");
        assert_eq!(snaps[0].filesystem, "tank/a");
        assert_eq!(find(&snaps, "2024-05-02").map(|s| s.used_bytes), Some(10));
        Ok(())
    }

    #[test]
    fn test_missing_filesystem_is_catalog_unavailable() {
        let vol = MemoryVolume::new();
        let err = load(&vol, "tank/missing").unwrap_err();
        assert!(matches!(err, Error::CatalogUnavailable { ref filesystem, .. } if filesystem == "tank/missing"));

        vol.add_filesystem("tank/locked");
        vol.make_unavailable("tank/locked");
        assert!(matches!(load(&vol, "tank/locked"), Err(Error::CatalogUnavailable { .. })));
    }
}
