//! Enrolled identities and their reference embeddings.

use crate::{parse_datetime, StoreError};
use chrono::Local;
use rollcall_core::{Embedding, Identity};
use rusqlite::{params, Connection};
use std::collections::HashMap;

/// Load every identity with its references in enrollment order.
pub fn load_identities(conn: &Connection) -> Result<Vec<Identity>, StoreError> {
    let mut identities: Vec<Identity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut stmt = conn.prepare("SELECT enrollment, name FROM identities ORDER BY enrollment")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, name) = row?;
        index.insert(id.clone(), identities.len());
        identities.push(Identity {
            id,
            name,
            references: Vec::new(),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT enrollment, vector FROM identity_embeddings ORDER BY enrollment, position",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, vector) = row?;
        let values: Vec<f32> = serde_json::from_str(&vector).map_err(|e| StoreError::Corrupt {
            field: "identity_embeddings.vector",
            reason: format!("{id}: {e}"),
        })?;
        if let Some(&i) = index.get(&id) {
            identities[i].references.push(Embedding::new(values));
        }
    }

    Ok(identities)
}

/// Insert or wholesale replace an identity and its references.
pub fn replace_identity(conn: &mut Connection, identity: &Identity) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO identities (enrollment, name, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(enrollment) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        params![identity.id, identity.name, Local::now().to_rfc3339()],
    )?;
    tx.execute(
        "DELETE FROM identity_embeddings WHERE enrollment = ?1",
        params![identity.id],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO identity_embeddings (enrollment, position, vector) VALUES (?1, ?2, ?3)",
        )?;
        for (position, reference) in identity.references.iter().enumerate() {
            let vector = serde_json::to_string(&reference.values).map_err(|e| StoreError::Corrupt {
                field: "identity_embeddings.vector",
                reason: e.to_string(),
            })?;
            stmt.execute(params![identity.id, position as i64, vector])?;
        }
    }
    tx.commit()?;
    tracing::info!(
        identity = %identity.id,
        references = identity.references.len(),
        "identity enrolled"
    );
    Ok(())
}

/// Delete an identity; its references go with it.
pub fn remove_identity(conn: &Connection, identity_id: &str) -> Result<bool, StoreError> {
    let removed = conn.execute(
        "DELETE FROM identities WHERE enrollment = ?1",
        params![identity_id],
    )?;
    Ok(removed > 0)
}

/// Cheap fingerprint that changes whenever an identity is enrolled,
/// re-enrolled or removed.
pub fn catalog_revision(conn: &Connection) -> Result<String, StoreError> {
    let (count, latest): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(updated_at) FROM identities",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if let Some(raw) = &latest {
        parse_datetime(raw, "identities.updated_at")?;
    }
    Ok(format!("{count}:{}", latest.unwrap_or_default()))
}

/// Display names keyed by identity id.
pub fn identity_names(conn: &Connection) -> Result<HashMap<String, String>, StoreError> {
    let mut stmt = conn.prepare("SELECT enrollment, name FROM identities")?;
    let names = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn identity(id: &str, refs: &[&[f32]]) -> Identity {
        Identity {
            id: id.into(),
            name: format!("Student {id}"),
            references: refs.iter().map(|r| Embedding::new(r.to_vec())).collect(),
        }
    }

    #[test]
    fn test_replace_and_load() {
        let mut store = Store::open_in_memory().unwrap();
        replace_identity(store.connection_mut(), &identity("S2", &[&[0.5, 0.5]])).unwrap();
        replace_identity(
            store.connection_mut(),
            &identity("S1", &[&[0.1, 0.2], &[0.3, 0.4]]),
        )
        .unwrap();

        let loaded = load_identities(store.connection()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "S1");
        assert_eq!(loaded[0].references[1].values, vec![0.3, 0.4]);
        assert_eq!(loaded[1].id, "S2");

        let names = identity_names(store.connection()).unwrap();
        assert_eq!(names.get("S1").map(String::as_str), Some("Student S1"));
        assert_eq!(names.get("S2").map(String::as_str), Some("Student S2"));
    }

    #[test]
    fn test_reenrollment_replaces_references_wholesale() {
        let mut store = Store::open_in_memory().unwrap();
        replace_identity(
            store.connection_mut(),
            &identity("S1", &[&[0.0], &[1.0], &[2.0]]),
        )
        .unwrap();
        replace_identity(store.connection_mut(), &identity("S1", &[&[9.0]])).unwrap();

        let loaded = load_identities(store.connection()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].references.len(), 1);
        assert_eq!(loaded[0].references[0].values, vec![9.0]);
    }

    #[test]
    fn test_remove_cascades_embeddings() {
        let mut store = Store::open_in_memory().unwrap();
        replace_identity(store.connection_mut(), &identity("S1", &[&[0.0]])).unwrap();
        assert!(remove_identity(store.connection(), "S1").unwrap());
        assert!(!remove_identity(store.connection(), "S1").unwrap());

        let orphans: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM identity_embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_revision_changes_on_enrollment() {
        let mut store = Store::open_in_memory().unwrap();
        let empty = catalog_revision(store.connection()).unwrap();
        replace_identity(store.connection_mut(), &identity("S1", &[&[0.0]])).unwrap();
        let after = catalog_revision(store.connection()).unwrap();
        assert_ne!(empty, after);
        assert!(after.starts_with("1:"));

        remove_identity(store.connection(), "S1").unwrap();
        assert_eq!(catalog_revision(store.connection()).unwrap(), empty);
    }

    #[test]
    fn test_corrupt_vector_reported() {
        let store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "INSERT INTO identities VALUES ('S1', 'Ana', '2026-10-19T08:00:00+00:00');
                 INSERT INTO identity_embeddings VALUES ('S1', 0, 'not-json');",
            )
            .unwrap();
        assert!(matches!(
            load_identities(store.connection()),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
