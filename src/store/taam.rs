//! Taam alignments and consensus rows.

use rusqlite::{params, OptionalExtension};

use crate::domain::{TaamAlignment, TaamConsensus, VerseId};

use super::{parse_json, ts, Store, StoreError};

impl Store {
    /// Replace a witness's alignment for a verse and layer
    pub fn upsert_taam_alignment(&self, alignment: &TaamAlignment) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO taam_alignments (verse_id, witness_id, target_layer, target_text_hash,
                                         payload_json, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(verse_id, witness_id, target_layer) DO UPDATE SET
                target_text_hash = excluded.target_text_hash,
                payload_json = excluded.payload_json,
                computed_at = excluded.computed_at
            ",
            params![
                alignment.verse_id.to_string(),
                alignment.witness_id,
                alignment.target_layer,
                alignment.target_text_hash,
                serde_json::to_string(alignment)?,
                ts(alignment.computed_at),
            ],
        )?;
        Ok(())
    }

    /// All alignments for a verse and layer, whatever hash they were computed against
    pub fn taam_alignments(
        &self,
        verse_id: &VerseId,
        target_layer: &str,
    ) -> Result<Vec<TaamAlignment>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM taam_alignments
             WHERE verse_id = ?1 AND target_layer = ?2
             ORDER BY witness_id",
        )?;
        let rows = stmt
            .query_map(params![verse_id.to_string(), target_layer], |row| {
                let payload: String = row.get(0)?;
                parse_json::<TaamAlignment>(0, &payload)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_taam_consensus(&self, consensus: &TaamConsensus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO taam_consensus (verse_id, target_layer, target_text_hash, payload_json, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(verse_id, target_layer) DO UPDATE SET
                target_text_hash = excluded.target_text_hash,
                payload_json = excluded.payload_json,
                computed_at = excluded.computed_at
            ",
            params![
                consensus.verse_id.to_string(),
                consensus.target_layer,
                consensus.target_text_hash,
                serde_json::to_string(consensus)?,
                ts(consensus.computed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_taam_consensus(
        &self,
        verse_id: &VerseId,
        target_layer: &str,
    ) -> Result<Option<TaamConsensus>, StoreError> {
        let conn = self.lock()?;
        let consensus = conn
            .query_row(
                "SELECT payload_json FROM taam_consensus WHERE verse_id = ?1 AND target_layer = ?2",
                params![verse_id.to_string(), target_layer],
                |row| {
                    let payload: String = row.get(0)?;
                    parse_json::<TaamConsensus>(0, &payload)
                },
            )
            .optional()?;
        Ok(consensus)
    }
}
