use crate::StoreError;
use rusqlite::{params, Connection};

/// An identity expected in a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub identity_id: String,
    /// Display name, when the identity has been enrolled.
    pub name: Option<String>,
}

pub fn roster_for(conn: &Connection, class_id: &str) -> Result<Vec<RosterEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT r.enrollment, i.name
         FROM roster r
         LEFT JOIN identities i ON i.enrollment = r.enrollment
         WHERE r.class_id = ?1
         ORDER BY r.enrollment",
    )?;
    let entries = stmt
        .query_map(params![class_id], |row| {
            Ok(RosterEntry {
                identity_id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Add identities to a class roster; existing entries are left alone.
pub fn add_to_roster(
    conn: &mut Connection,
    class_id: &str,
    identity_ids: &[String],
) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut added = 0;
    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO roster (class_id, enrollment) VALUES (?1, ?2)")?;
        for id in identity_ids {
            added += stmt.execute(params![class_id, id])?;
        }
    }
    tx.commit()?;
    Ok(added)
}

pub fn remove_from_roster(
    conn: &Connection,
    class_id: &str,
    identity_id: &str,
) -> Result<bool, StoreError> {
    let removed = conn.execute(
        "DELETE FROM roster WHERE class_id = ?1 AND enrollment = ?2",
        params![class_id, identity_id],
    )?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_roster_add_is_idempotent_and_scoped() {
        let mut store = Store::open_in_memory().unwrap();
        let ids = vec!["S2".to_string(), "S1".to_string()];
        assert_eq!(add_to_roster(store.connection_mut(), "MATH110", &ids).unwrap(), 2);
        assert_eq!(add_to_roster(store.connection_mut(), "MATH110", &ids).unwrap(), 0);
        add_to_roster(store.connection_mut(), "PHYS200", &["S9".to_string()]).unwrap();

        let roster = roster_for(store.connection(), "MATH110").unwrap();
        let ids: Vec<&str> = roster.iter().map(|e| e.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert!(roster.iter().all(|e| e.name.is_none()));
    }

    #[test]
    fn test_roster_joins_names() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO identities VALUES ('S1', 'Ana Lima', '2026-10-19T08:00:00+00:00')",
                [],
            )
            .unwrap();
        add_to_roster(store.connection_mut(), "MATH110", &["S1".to_string()]).unwrap();
        let roster = roster_for(store.connection(), "MATH110").unwrap();
        assert_eq!(roster[0].name.as_deref(), Some("Ana Lima"));
    }

    #[test]
    fn test_remove_from_roster() {
        let mut store = Store::open_in_memory().unwrap();
        add_to_roster(store.connection_mut(), "MATH110", &["S1".to_string()]).unwrap();
        assert!(remove_from_roster(store.connection(), "MATH110", "S1").unwrap());
        assert!(roster_for(store.connection(), "MATH110").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_class_has_empty_roster() {
        let store = Store::open_in_memory().unwrap();
        assert!(roster_for(store.connection(), "NOPE").unwrap().is_empty());
    }
}
