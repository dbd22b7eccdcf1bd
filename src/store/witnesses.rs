//! Verses, witnesses, pages and regions.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{
    BBox, CascadeGroup, Page, Region, RegionStatus, RemapState, Verse, VerseId, VerseRange,
    Witness,
};

use super::{parse_json, parse_text, ts, Store, StoreError};

const REGION_COLUMNS: &str = "id, page_id, witness_id, bbox_json, start_verse, end_verse, status, ocr_text, ocr_confidence, remap_json";

impl Store {
    // ------------------------------------------------------------------
    // Verses
    // ------------------------------------------------------------------

    pub fn upsert_verse(&self, verse: &Verse) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO verses (id, book, chapter, verse, baseline_text)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET baseline_text = excluded.baseline_text
            ",
            params![
                verse.id.to_string(),
                verse.id.book,
                verse.id.chapter,
                verse.id.verse,
                verse.baseline_text
            ],
        )?;
        Ok(())
    }

    pub fn get_verse(&self, id: &VerseId) -> Result<Option<Verse>, StoreError> {
        let conn = self.lock()?;
        let verse = conn
            .query_row(
                "SELECT id, baseline_text FROM verses WHERE id = ?1",
                [id.to_string()],
                verse_from_row,
            )
            .optional()?;
        Ok(verse)
    }

    /// All verses in canonical (book-order-aware) order
    pub fn list_verses(&self) -> Result<Vec<Verse>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, baseline_text FROM verses")?;
        let mut verses = stmt
            .query_map([], verse_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        verses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(verses)
    }

    pub fn verses_in_book(&self, book: &str) -> Result<Vec<Verse>, StoreError> {
        Ok(self
            .list_verses()?
            .into_iter()
            .filter(|v| v.id.book.eq_ignore_ascii_case(book))
            .collect())
    }

    pub fn verses_in_range(&self, range: &VerseRange) -> Result<Vec<Verse>, StoreError> {
        Ok(self
            .list_verses()?
            .into_iter()
            .filter(|v| range.contains(&v.id))
            .collect())
    }

    // ------------------------------------------------------------------
    // Witnesses
    // ------------------------------------------------------------------

    /// Insert or update a witness. Priority tiers must stay unique.
    pub fn upsert_witness(&self, witness: &Witness) -> Result<(), StoreError> {
        if !(0.0..=1.0).contains(&witness.authority_weight) {
            return Err(StoreError::InvalidInput(format!(
                "authority weight {} for witness {} is outside [0, 1]",
                witness.authority_weight, witness.id
            )));
        }

        let conn = self.lock()?;

        if let Some(tier) = witness.priority_tier {
            let holder: Option<String> = conn
                .query_row(
                    "SELECT id FROM witnesses WHERE priority_tier = ?1 AND id != ?2",
                    params![tier, witness.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(holder) = holder {
                return Err(StoreError::InvalidInput(format!(
                    "priority tier {} is already assigned to witness {}",
                    tier, holder
                )));
            }
        }

        conn.execute(
            "
            INSERT INTO witnesses (id, name, witness_type, priority_tier, authority_weight, cascade_group)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                witness_type = excluded.witness_type,
                priority_tier = excluded.priority_tier,
                authority_weight = excluded.authority_weight,
                cascade_group = excluded.cascade_group
            ",
            params![
                witness.id,
                witness.name,
                witness.witness_type.as_str(),
                witness.priority_tier,
                witness.authority_weight,
                witness.cascade_group.map(|g| g.as_str()),
            ],
        )?;
        Ok(())
    }

    pub fn get_witness(&self, id: &str) -> Result<Option<Witness>, StoreError> {
        let conn = self.lock()?;
        let witness = conn
            .query_row(
                "SELECT id, name, witness_type, priority_tier, authority_weight, cascade_group
                 FROM witnesses WHERE id = ?1",
                [id],
                witness_from_row,
            )
            .optional()?;
        Ok(witness)
    }

    pub fn require_witness(&self, id: &str) -> Result<Witness, StoreError> {
        self.get_witness(id)?
            .ok_or_else(|| StoreError::not_found("witness", id))
    }

    /// Witnesses ordered by priority tier (untiered last), then id
    pub fn list_witnesses(&self) -> Result<Vec<Witness>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, witness_type, priority_tier, authority_weight, cascade_group
             FROM witnesses
             ORDER BY priority_tier IS NULL, priority_tier ASC, id ASC",
        )?;
        let witnesses = stmt
            .query_map([], witness_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(witnesses)
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    pub fn upsert_page(&self, page: &Page) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO pages (id, witness_id, path, width, height)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                witness_id = excluded.witness_id,
                path = excluded.path,
                width = excluded.width,
                height = excluded.height
            ",
            params![
                page.id,
                page.witness_id,
                page.path.to_string_lossy(),
                page.width,
                page.height
            ],
        )?;
        Ok(())
    }

    pub fn get_page(&self, id: &str) -> Result<Option<Page>, StoreError> {
        let conn = self.lock()?;
        let page = conn
            .query_row(
                "SELECT id, witness_id, path, width, height FROM pages WHERE id = ?1",
                [id],
                |row| {
                    Ok(Page {
                        id: row.get(0)?,
                        witness_id: row.get(1)?,
                        path: row.get::<_, String>(2)?.into(),
                        width: row.get(3)?,
                        height: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    pub fn upsert_region(&self, region: &Region) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO regions (id, page_id, witness_id, bbox_json, start_verse, end_verse,
                                 status, ocr_text, ocr_confidence, remap_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                page_id = excluded.page_id,
                witness_id = excluded.witness_id,
                bbox_json = excluded.bbox_json,
                start_verse = excluded.start_verse,
                end_verse = excluded.end_verse,
                status = excluded.status,
                ocr_text = excluded.ocr_text,
                ocr_confidence = excluded.ocr_confidence,
                remap_json = excluded.remap_json,
                updated_at = excluded.updated_at
            ",
            params![
                region.id,
                region.page_id,
                region.witness_id,
                serde_json::to_string(&region.bbox)?,
                region.start_verse.as_ref().map(|v| v.to_string()),
                region.end_verse.as_ref().map(|v| v.to_string()),
                region.status.as_str(),
                region.ocr_text,
                region.ocr_confidence,
                serde_json::to_string(&region.remap)?,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_region(&self, id: &str) -> Result<Option<Region>, StoreError> {
        let conn = self.lock()?;
        let region = conn
            .query_row(
                &format!("SELECT {} FROM regions WHERE id = ?1", REGION_COLUMNS),
                [id],
                region_from_row,
            )
            .optional()?;
        Ok(region)
    }

    pub fn require_region(&self, id: &str) -> Result<Region, StoreError> {
        self.get_region(id)?
            .ok_or_else(|| StoreError::not_found("region", id))
    }

    pub fn list_regions_for_witness(&self, witness_id: &str) -> Result<Vec<Region>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM regions WHERE witness_id = ?1 ORDER BY id",
            REGION_COLUMNS
        ))?;
        let regions = stmt
            .query_map([witness_id], region_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(regions)
    }

    /// Record OCR output for a region
    pub fn set_region_ocr(
        &self,
        id: &str,
        text: &str,
        confidence: f64,
        status: RegionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE regions SET ocr_text = ?2, ocr_confidence = ?3, status = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, text, confidence, status.as_str(), ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("region", id));
        }
        Ok(())
    }

    pub fn set_region_status(&self, id: &str, status: RegionStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE regions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("region", id));
        }
        Ok(())
    }

    /// Retag a region's verse range and remap bookkeeping
    pub fn set_region_tagging(
        &self,
        id: &str,
        range: Option<&VerseRange>,
        remap: &RemapState,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE regions SET start_verse = ?2, end_verse = ?3, remap_json = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                range.map(|r| r.start.to_string()),
                range.map(|r| r.end.to_string()),
                serde_json::to_string(remap)?,
                ts(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("region", id));
        }
        Ok(())
    }
}

fn verse_from_row(row: &Row<'_>) -> rusqlite::Result<Verse> {
    let id: String = row.get(0)?;
    Ok(Verse {
        id: parse_text(0, &id)?,
        baseline_text: row.get(1)?,
    })
}

fn witness_from_row(row: &Row<'_>) -> rusqlite::Result<Witness> {
    let witness_type: String = row.get(2)?;
    let cascade_group: Option<String> = row.get(5)?;
    Ok(Witness {
        id: row.get(0)?,
        name: row.get(1)?,
        witness_type: parse_text(2, &witness_type)?,
        priority_tier: row.get(3)?,
        authority_weight: row.get(4)?,
        cascade_group: cascade_group
            .map(|g| parse_text::<CascadeGroup>(5, &g))
            .transpose()?,
    })
}

fn region_from_row(row: &Row<'_>) -> rusqlite::Result<Region> {
    let bbox_json: String = row.get(3)?;
    let start: Option<String> = row.get(4)?;
    let end: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;
    let remap_json: String = row.get(9)?;

    Ok(Region {
        id: row.get(0)?,
        page_id: row.get(1)?,
        witness_id: row.get(2)?,
        bbox: parse_json::<BBox>(3, &bbox_json)?,
        start_verse: start.map(|s| parse_text::<VerseId>(4, &s)).transpose()?,
        end_verse: end.map(|s| parse_text::<VerseId>(5, &s)).transpose()?,
        status: parse_text::<RegionStatus>(6, &status)?,
        ocr_text: row.get(7)?,
        ocr_confidence: row.get(8)?,
        remap: parse_json::<RemapState>(9, &remap_json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BBoxUnits, WitnessType};

    fn witness(id: &str, tier: Option<u32>) -> Witness {
        Witness {
            id: id.to_string(),
            name: id.to_uppercase(),
            witness_type: WitnessType::Manuscript,
            priority_tier: tier,
            authority_weight: 0.9,
            cascade_group: Some(CascadeGroup::A),
        }
    }

    #[test]
    fn test_witness_roundtrip_and_order() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_witness(&witness("leningrad", Some(2))).unwrap();
        store.upsert_witness(&witness("aleppo", Some(1))).unwrap();
        store.upsert_witness(&witness("extra", None)).unwrap();

        let ids: Vec<String> = store
            .list_witnesses()
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["aleppo", "leningrad", "extra"]);

        let aleppo = store.require_witness("aleppo").unwrap();
        assert_eq!(aleppo.cascade_group, Some(CascadeGroup::A));
        assert!(matches!(
            store.require_witness("missing"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_priority_tier_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_witness(&witness("a", Some(1))).unwrap();
        let result = store.upsert_witness(&witness("b", Some(1)));
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));

        // Re-saving the holder itself is fine
        store.upsert_witness(&witness("a", Some(1))).unwrap();
    }

    #[test]
    fn test_verses_in_canonical_order() {
        let store = Store::open_in_memory().unwrap();
        for id in ["Exodus 1:1", "Genesis 1:10", "Genesis 1:2", "Genesis 2:1"] {
            store
                .upsert_verse(&Verse {
                    id: id.parse().unwrap(),
                    baseline_text: String::new(),
                })
                .unwrap();
        }

        let ids: Vec<String> = store
            .list_verses()
            .unwrap()
            .into_iter()
            .map(|v| v.id.to_string())
            .collect();
        assert_eq!(ids, vec!["Genesis 1:2", "Genesis 1:10", "Genesis 2:1", "Exodus 1:1"]);

        let range = VerseRange::new("Genesis 1:2".parse().unwrap(), "Genesis 2:1".parse().unwrap());
        assert_eq!(store.verses_in_range(&range).unwrap().len(), 3);
        assert_eq!(store.verses_in_book("genesis").unwrap().len(), 3);
    }

    #[test]
    fn test_region_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_witness(&witness("aleppo", Some(1))).unwrap();
        store
            .upsert_page(&Page {
                id: "p1".into(),
                witness_id: "aleppo".into(),
                path: "/scans/p1.png".into(),
                width: Some(2000),
                height: Some(3000),
            })
            .unwrap();

        let region = Region {
            id: "r1".into(),
            page_id: "p1".into(),
            witness_id: "aleppo".into(),
            bbox: BBox {
                x: 0.1,
                y: 0.2,
                width: 0.5,
                height: 0.1,
                units: BBoxUnits::Normalized,
            },
            start_verse: Some("Genesis 1:1".parse().unwrap()),
            end_verse: Some("Genesis 1:2".parse().unwrap()),
            status: RegionStatus::Ok,
            ocr_text: None,
            ocr_confidence: None,
            remap: RemapState::default(),
        };
        store.upsert_region(&region).unwrap();
        assert_eq!(store.require_region("r1").unwrap(), region);

        store
            .set_region_ocr("r1", "text", 0.8, RegionStatus::Partial)
            .unwrap();
        let updated = store.require_region("r1").unwrap();
        assert_eq!(updated.ocr_text.as_deref(), Some("text"));
        assert_eq!(updated.status, RegionStatus::Partial);
        assert_eq!(store.list_regions_for_witness("aleppo").unwrap().len(), 1);
    }
}
