//! Per-witness run state.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use crate::domain::{RunState, Stage, StageState};

use super::{parse_json, parse_ts, ts, Store, StoreError};

impl Store {
    /// Stored run state, or a fresh all-pending state for the witness
    pub fn get_run_state(&self, witness_id: &str) -> Result<RunState, StoreError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT stages_json, updated_at FROM run_states WHERE witness_id = ?1",
                [witness_id],
                |row| {
                    let stages: String = row.get(0)?;
                    Ok(RunState {
                        witness_id: witness_id.to_string(),
                        stages: parse_json::<BTreeMap<Stage, StageState>>(0, &stages)?,
                        updated_at: parse_ts(1, row.get(1)?)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| RunState::new(witness_id)))
    }

    pub fn upsert_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO run_states (witness_id, stages_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(witness_id) DO UPDATE SET
                stages_json = excluded.stages_json,
                updated_at = excluded.updated_at
            ",
            params![
                state.witness_id,
                serde_json::to_string(&state.stages)?,
                ts(state.updated_at)
            ],
        )?;
        Ok(())
    }

    /// Every stored run state, keyed by witness id
    pub fn list_run_states(&self) -> Result<BTreeMap<String, RunState>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT witness_id, stages_json, updated_at FROM run_states")?;
        let rows = stmt.query_map([], |row| {
            let witness_id: String = row.get(0)?;
            let stages: String = row.get(1)?;
            Ok(RunState {
                witness_id,
                stages: parse_json(1, &stages)?,
                updated_at: parse_ts(2, row.get(2)?)?,
            })
        })?;

        let mut states = BTreeMap::new();
        for state in rows {
            let state = state?;
            states.insert(state.witness_id.clone(), state);
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Blocker, StageStatus, Witness, WitnessType};

    #[test]
    fn test_run_state_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_witness(&Witness {
                id: "w2".into(),
                name: "W2".into(),
                witness_type: WitnessType::Manuscript,
                priority_tier: Some(2),
                authority_weight: 0.8,
                cascade_group: None,
            })
            .unwrap();

        let fresh = store.get_run_state("w2").unwrap();
        assert_eq!(fresh.status(Stage::Ocr), StageStatus::Pending);

        let mut state = fresh;
        state.set_stage(
            Stage::Ocr,
            StageState {
                status: StageStatus::Blocked,
                blockers: vec![Blocker::priority(Stage::Ocr, "w1", 1, StageStatus::Pending)],
                ..Default::default()
            },
        );
        store.upsert_run_state(&state).unwrap();

        let stored = store.get_run_state("w2").unwrap();
        assert_eq!(stored.status(Stage::Ocr), StageStatus::Blocked);
        assert_eq!(stored.stage(Stage::Ocr).blockers[0].reason_code, "P1_OCR_PENDING");
        assert_eq!(store.list_run_states().unwrap().len(), 1);
    }
}
