//! Witness-verse rows and the committed working text.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{
    RegionStatus, VerseId, WitnessVerse, WitnessVerseArtifacts, WorkingVerseText,
};

use super::{parse_json, parse_text, parse_ts, ts, Store, StoreError};

const WITNESS_VERSE_COLUMNS: &str = "verse_id, witness_id, raw_text, normalized_text, clarity, match_score, completeness, confidence, status, artifacts_json, updated_at";

impl Store {
    /// Upsert one witness-verse row.
    ///
    /// The stored artifact bag is merged with `row.artifacts` rather than
    /// replaced, so keys this crate does not know about survive. Returns the
    /// row as stored.
    pub fn upsert_witness_verse(&self, row: &WitnessVerse) -> Result<WitnessVerse, StoreError> {
        check_unit("confidence", row.confidence)?;

        let conn = self.lock()?;
        let mut artifacts = fetch_witness_verse(&conn, &row.verse_id, &row.witness_id)?
            .map(|existing| existing.artifacts)
            .unwrap_or_default();
        artifacts.merge(row.artifacts.clone());

        let now = Utc::now();
        conn.execute(
            "
            INSERT INTO witness_verses (verse_id, witness_id, raw_text, normalized_text, clarity,
                                        match_score, completeness, confidence, status,
                                        artifacts_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(verse_id, witness_id) DO UPDATE SET
                raw_text = excluded.raw_text,
                normalized_text = excluded.normalized_text,
                clarity = excluded.clarity,
                match_score = excluded.match_score,
                completeness = excluded.completeness,
                confidence = excluded.confidence,
                status = excluded.status,
                artifacts_json = excluded.artifacts_json,
                updated_at = excluded.updated_at
            ",
            params![
                row.verse_id.to_string(),
                row.witness_id,
                row.raw_text,
                row.normalized_text,
                row.clarity,
                row.match_score,
                row.completeness,
                row.confidence,
                row.status.as_str(),
                serde_json::to_string(&artifacts)?,
                ts(now),
            ],
        )?;

        Ok(WitnessVerse {
            artifacts,
            updated_at: now,
            ..row.clone()
        })
    }

    /// Update only the confidence of an existing row, merging `artifacts`
    pub fn update_witness_verse_confidence(
        &self,
        verse_id: &VerseId,
        witness_id: &str,
        confidence: f64,
        artifacts: WitnessVerseArtifacts,
    ) -> Result<WitnessVerse, StoreError> {
        check_unit("confidence", confidence)?;

        let conn = self.lock()?;
        let mut current = fetch_witness_verse(&conn, verse_id, witness_id)?.ok_or_else(|| {
            StoreError::not_found("witness verse", format!("{}/{}", verse_id, witness_id))
        })?;
        current.artifacts.merge(artifacts);
        current.confidence = confidence;
        current.updated_at = Utc::now();

        conn.execute(
            "UPDATE witness_verses SET confidence = ?3, artifacts_json = ?4, updated_at = ?5
             WHERE verse_id = ?1 AND witness_id = ?2",
            params![
                verse_id.to_string(),
                witness_id,
                confidence,
                serde_json::to_string(&current.artifacts)?,
                ts(current.updated_at),
            ],
        )?;
        Ok(current)
    }

    pub fn set_witness_verse_status(
        &self,
        verse_id: &VerseId,
        witness_id: &str,
        status: RegionStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE witness_verses SET status = ?3, updated_at = ?4
             WHERE verse_id = ?1 AND witness_id = ?2",
            params![verse_id.to_string(), witness_id, status.as_str(), ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub fn get_witness_verse(
        &self,
        verse_id: &VerseId,
        witness_id: &str,
    ) -> Result<Option<WitnessVerse>, StoreError> {
        let conn = self.lock()?;
        fetch_witness_verse(&conn, verse_id, witness_id)
    }

    pub fn witness_verses_for_verse(
        &self,
        verse_id: &VerseId,
    ) -> Result<Vec<WitnessVerse>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM witness_verses WHERE verse_id = ?1 ORDER BY witness_id",
            WITNESS_VERSE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([verse_id.to_string()], witness_verse_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// A witness's rows in canonical verse order
    pub fn witness_verses_for_witness(
        &self,
        witness_id: &str,
    ) -> Result<Vec<WitnessVerse>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM witness_verses WHERE witness_id = ?1",
            WITNESS_VERSE_COLUMNS
        ))?;
        let mut rows = stmt
            .query_map([witness_id], witness_verse_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| a.verse_id.cmp(&b.verse_id));
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Working text
    // ------------------------------------------------------------------

    /// Overwrite the working text for a verse (one row per verse)
    pub fn upsert_working_text(&self, text: &WorkingVerseText) -> Result<(), StoreError> {
        check_unit("ensemble confidence", text.ensemble_confidence)?;

        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO working_verse_texts (verse_id, text_hash, ensemble_confidence, payload_json, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(verse_id) DO UPDATE SET
                text_hash = excluded.text_hash,
                ensemble_confidence = excluded.ensemble_confidence,
                payload_json = excluded.payload_json,
                computed_at = excluded.computed_at
            ",
            params![
                text.verse_id.to_string(),
                text.text_hash,
                text.ensemble_confidence,
                serde_json::to_string(text)?,
                ts(text.computed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_working_text(
        &self,
        verse_id: &VerseId,
    ) -> Result<Option<WorkingVerseText>, StoreError> {
        let conn = self.lock()?;
        let text = conn
            .query_row(
                "SELECT payload_json FROM working_verse_texts WHERE verse_id = ?1",
                [verse_id.to_string()],
                |row| {
                    let payload: String = row.get(0)?;
                    parse_json::<WorkingVerseText>(0, &payload)
                },
            )
            .optional()?;
        Ok(text)
    }

    pub fn list_working_texts(&self) -> Result<Vec<WorkingVerseText>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT payload_json FROM working_verse_texts")?;
        let mut texts = stmt
            .query_map([], |row| {
                let payload: String = row.get(0)?;
                parse_json::<WorkingVerseText>(0, &payload)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        texts.sort_by(|a, b| a.verse_id.cmp(&b.verse_id));
        Ok(texts)
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), StoreError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(StoreError::InvalidInput(format!(
            "{} {} is outside [0, 1]",
            field, value
        )))
    }
}

fn fetch_witness_verse(
    conn: &Connection,
    verse_id: &VerseId,
    witness_id: &str,
) -> Result<Option<WitnessVerse>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM witness_verses WHERE verse_id = ?1 AND witness_id = ?2",
                WITNESS_VERSE_COLUMNS
            ),
            params![verse_id.to_string(), witness_id],
            witness_verse_from_row,
        )
        .optional()?;
    Ok(row)
}

fn witness_verse_from_row(row: &Row<'_>) -> rusqlite::Result<WitnessVerse> {
    let verse_id: String = row.get(0)?;
    let status: String = row.get(8)?;
    let artifacts: String = row.get(9)?;
    Ok(WitnessVerse {
        verse_id: parse_text(0, &verse_id)?,
        witness_id: row.get(1)?,
        raw_text: row.get(2)?,
        normalized_text: row.get(3)?,
        clarity: row.get(4)?,
        match_score: row.get(5)?,
        completeness: row.get(6)?,
        confidence: row.get(7)?,
        status: parse_text(8, &status)?,
        artifacts: parse_json(9, &artifacts)?,
        updated_at: parse_ts(10, row.get(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SelectedSource, Witness, WitnessType};
    use serde_json::json;

    fn store_with_witness() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_witness(&Witness {
                id: "aleppo".into(),
                name: "Aleppo".into(),
                witness_type: WitnessType::Manuscript,
                priority_tier: Some(1),
                authority_weight: 1.0,
                cascade_group: None,
            })
            .unwrap();
        store
    }

    fn row(confidence: f64, artifacts: WitnessVerseArtifacts) -> WitnessVerse {
        WitnessVerse {
            verse_id: "Genesis 1:1".parse().unwrap(),
            witness_id: "aleppo".into(),
            raw_text: "בראשית ברא".into(),
            normalized_text: "בראשית ברא".into(),
            clarity: 0.9,
            match_score: 1.0,
            completeness: 1.0,
            confidence,
            status: RegionStatus::Ok,
            artifacts,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_preserves_unknown_artifact_keys() {
        let store = store_with_witness();
        let mut seeded = WitnessVerseArtifacts::default();
        seeded.extra.insert("reviewer".into(), json!("dh"));
        store.upsert_witness_verse(&row(0.5, seeded)).unwrap();

        let stored = store
            .update_witness_verse_confidence(
                &"Genesis 1:1".parse().unwrap(),
                "aleppo",
                0.8,
                WitnessVerseArtifacts {
                    source_region_id: Some("r1".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(stored.confidence, 0.8);

        let reread = store
            .get_witness_verse(&"Genesis 1:1".parse().unwrap(), "aleppo")
            .unwrap()
            .unwrap();
        assert_eq!(reread.artifacts.extra.get("reviewer"), Some(&json!("dh")));
        assert_eq!(reread.artifacts.source_region_id.as_deref(), Some("r1"));

        // A full upsert with an empty bag keeps everything too
        store
            .upsert_witness_verse(&row(0.6, WitnessVerseArtifacts::default()))
            .unwrap();
        let reread = store
            .get_witness_verse(&"Genesis 1:1".parse().unwrap(), "aleppo")
            .unwrap()
            .unwrap();
        assert_eq!(reread.artifacts.extra.get("reviewer"), Some(&json!("dh")));
        assert_eq!(reread.confidence, 0.6);
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let store = store_with_witness();
        let result = store.upsert_witness_verse(&row(1.2, WitnessVerseArtifacts::default()));
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn test_working_text_overwrites() {
        let store = Store::open_in_memory().unwrap();
        let verse_id: VerseId = "Genesis 1:1".parse().unwrap();
        let mut text = WorkingVerseText {
            verse_id: verse_id.clone(),
            selected_source: SelectedSource::Baseline,
            surface_text: "a".into(),
            normalized_text: "a".into(),
            text_hash: "h1".into(),
            ensemble_confidence: 0.45,
            flags: vec![],
            reason_codes: vec!["CANDIDATES_BELOW_THRESHOLD".into()],
            computed_at: Utc::now(),
        };
        store.upsert_working_text(&text).unwrap();

        text.selected_source = SelectedSource::Witness("aleppo".into());
        text.text_hash = "h2".into();
        store.upsert_working_text(&text).unwrap();

        let stored = store.get_working_text(&verse_id).unwrap().unwrap();
        assert_eq!(stored.text_hash, "h2");
        assert_eq!(store.list_working_texts().unwrap().len(), 1);
    }
}
