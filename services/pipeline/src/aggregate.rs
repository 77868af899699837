//! Region/sector summaries derived from the cleaned facility table.
//!
//! Every function here is pure over `&CleanedTable`; outputs are recomputed on each run.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::clean::{CleanedTable, FacilityRecord, REQUIRED_COLUMNS};
use crate::error::{PipelineError, Result};
use crate::similarity::{ColumnData, FeatureTable};

/// Label for records with no state or sector.
pub const UNKNOWN_ENTITY: &str = "Unknown";

/// Grouping dimension for aggregates and similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Region,
    Sector,
}

impl EntityKind {
    /// Identifier column name in output tables.
    pub fn id_column(self) -> &'static str {
        match self {
            EntityKind::Region => "state",
            EntityKind::Sector => "sector",
        }
    }

    fn key(self, record: &FacilityRecord) -> String {
        let value = match self {
            EntityKind::Region => record.state.as_deref(),
            EntityKind::Sector => record.industry_type_sectors.as_deref(),
        };
        value.unwrap_or(UNKNOWN_ENTITY).to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EmissionTotals {
    pub total_emissions: f64,
    pub co2: f64,
    pub ch4: f64,
    pub n2o: f64,
}

impl EmissionTotals {
    fn add(&mut self, record: &FacilityRecord) {
        self.total_emissions += record.total_reported_direct_emissions;
        self.co2 += record.co2_emissions_non_biogenic;
        self.ch4 += record.ch4_emissions;
        self.n2o += record.n2o_emissions;
    }
}

/// Region-year or sector-year row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearAggregate {
    pub entity: String,
    pub year: i32,
    pub totals: EmissionTotals,
    pub facility_count: usize,
}

/// One entity summarized across all years.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFeatures {
    pub entity: String,
    pub totals: EmissionTotals,
    pub facility_count: usize,
    pub mean_emissions_per_facility: f64,
    pub share_co2: f64,
    pub share_ch4: f64,
    pub share_n2o: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NationalTotal {
    pub year: i32,
    pub total_emissions: f64,
    pub facility_count: usize,
}

fn require_records(table: &CleanedTable, stage: &'static str) -> Result<()> {
    if table.is_empty() {
        Err(PipelineError::EmptyInput(stage))
    } else {
        Ok(())
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Sums species and counts facilities per (entity, year), ascending by entity then year.
pub fn aggregate_by_year(table: &CleanedTable, kind: EntityKind) -> Result<Vec<YearAggregate>> {
    require_records(table, "year aggregation")?;

    let mut groups: BTreeMap<(String, i32), (EmissionTotals, usize)> = BTreeMap::new();
    for record in &table.records {
        let entry = groups
            .entry((kind.key(record), record.reporting_year))
            .or_default();
        entry.0.add(record);
        entry.1 += 1;
    }

    Ok(groups
        .into_iter()
        .map(|((entity, year), (totals, facility_count))| YearAggregate {
            entity,
            year,
            totals,
            facility_count,
        })
        .collect())
}

pub fn region_year(table: &CleanedTable) -> Result<Vec<YearAggregate>> {
    aggregate_by_year(table, EntityKind::Region)
}

pub fn sector_year(table: &CleanedTable) -> Result<Vec<YearAggregate>> {
    aggregate_by_year(table, EntityKind::Sector)
}

/// Per-entity feature vectors collapsed across years.
///
/// `mean_emissions_per_facility` divides by max(count, 1). Shares divide by the entity's own
/// total and are clamped to [0, 1]; a zero total gives zero shares even when species mass
/// is present (e.g. a year whose total column was absent). Shares need not sum to 1.
pub fn entity_features(table: &CleanedTable, kind: EntityKind) -> Result<Vec<EntityFeatures>> {
    require_records(table, "feature derivation")?;

    let mut groups: BTreeMap<String, (EmissionTotals, usize)> = BTreeMap::new();
    for record in &table.records {
        let entry = groups.entry(kind.key(record)).or_default();
        entry.0.add(record);
        entry.1 += 1;
    }

    Ok(groups
        .into_iter()
        .map(|(entity, (totals, facility_count))| {
            let per_facility = facility_count.max(1) as f64;
            let share = |species: f64| {
                if totals.total_emissions == 0.0 {
                    0.0
                } else {
                    finite_or_zero(species / totals.total_emissions).clamp(0.0, 1.0)
                }
            };
            EntityFeatures {
                entity,
                totals,
                facility_count,
                mean_emissions_per_facility: finite_or_zero(totals.total_emissions / per_facility),
                share_co2: share(totals.co2),
                share_ch4: share(totals.ch4),
                share_n2o: share(totals.n2o),
            }
        })
        .collect())
}

/// Column names of a feature table, after the identifier column.
pub const FEATURE_COLUMNS: [&str; 9] = [
    "total_emissions",
    "co2",
    "ch4",
    "n2o",
    "facility_count",
    "mean_emissions_per_facility",
    "share_co2",
    "share_ch4",
    "share_n2o",
];

impl EntityFeatures {
    /// Values in `FEATURE_COLUMNS` order.
    pub fn values(&self) -> [f64; 9] {
        [
            self.totals.total_emissions,
            self.totals.co2,
            self.totals.ch4,
            self.totals.n2o,
            self.facility_count as f64,
            self.mean_emissions_per_facility,
            self.share_co2,
            self.share_ch4,
            self.share_n2o,
        ]
    }
}

/// Lays entity features out as a similarity input table.
pub fn feature_table(features: &[EntityFeatures], kind: EntityKind) -> Result<FeatureTable> {
    let mut table = FeatureTable::new(
        kind.id_column(),
        features.iter().map(|f| f.entity.clone()).collect(),
    );
    for (idx, name) in FEATURE_COLUMNS.iter().enumerate() {
        let values = features.iter().map(|f| f.values()[idx]).collect();
        table.push_column(*name, ColumnData::Numeric(values))?;
    }
    Ok(table)
}

/// National totals per reporting year, used to check mass conservation.
pub fn national_totals(table: &CleanedTable) -> Vec<NationalTotal> {
    let mut years: BTreeMap<i32, (f64, usize)> = BTreeMap::new();
    for record in &table.records {
        let entry = years.entry(record.reporting_year).or_default();
        entry.0 += record.total_reported_direct_emissions;
        entry.1 += 1;
    }
    years
        .into_iter()
        .map(|(year, (total_emissions, facility_count))| NationalTotal {
            year,
            total_emissions,
            facility_count,
        })
        .collect()
}

/// Years where summed aggregates differ from the national total by more than a relative 1e-9.
pub fn conservation_mismatches(aggregates: &[YearAggregate], national: &[NationalTotal]) -> Vec<i32> {
    let mut summed: BTreeMap<i32, f64> = BTreeMap::new();
    for row in aggregates {
        *summed.entry(row.year).or_default() += row.totals.total_emissions;
    }
    national
        .iter()
        .filter(|n| {
            let got = summed.get(&n.year).copied().unwrap_or(0.0);
            (got - n.total_emissions).abs() > 1e-9 * n.total_emissions.abs().max(1.0)
        })
        .map(|n| n.year)
        .collect()
}

/// Facility-grain export: the cleaned table projected onto the canonical columns it carries.
pub fn facility_export(table: &CleanedTable) -> (Vec<String>, Vec<Vec<String>>) {
    let columns: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| table.required_columns.iter().any(|r| r == *c))
        .map(|c| c.to_string())
        .collect();
    let rows = table
        .records
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| r.field_text(c).unwrap_or_default())
                .collect()
        })
        .collect();
    (columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::clean_tables;
    use crate::similarity::cosine_similarity_matrix;
    use crate::workbook::RawTable;
    use calamine::Data;
    use std::path::PathBuf;

    fn record(id: &str, state: Option<&str>, sector: Option<&str>, year: i32, emissions: [f64; 4]) -> FacilityRecord {
        FacilityRecord {
            facility_id: id.to_string(),
            facility_name: None,
            city: None,
            state: state.map(str::to_string),
            latitude: None,
            longitude: None,
            primary_naics_code: None,
            industry_type_sectors: sector.map(str::to_string),
            industry_type_subparts: None,
            total_reported_direct_emissions: emissions[0],
            co2_emissions_non_biogenic: emissions[1],
            ch4_emissions: emissions[2],
            n2o_emissions: emissions[3],
            reporting_year: year,
            extras: Vec::new(),
        }
    }

    fn cleaned(records: Vec<FacilityRecord>) -> CleanedTable {
        CleanedTable {
            required_columns: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            extra_columns: Vec::new(),
            records,
        }
    }

    fn sample() -> CleanedTable {
        cleaned(vec![
            record("1", Some("TX"), Some("Power Plants"), 2020, [100.0, 90.0, 5.0, 1.0]),
            record("2", Some("TX"), Some("Waste"), 2020, [50.0, 10.0, 35.0, 2.0]),
            record("3", Some("OK"), Some("Power Plants"), 2020, [30.0, 28.0, 1.0, 0.5]),
            record("1", Some("TX"), Some("Power Plants"), 2021, [80.0, 70.0, 4.0, 1.0]),
            record("4", None, None, 2021, [7.0, 0.0, 7.0, 0.0]),
            record("5", Some("AK"), Some("Petroleum and Natural Gas Systems"), 2021, [0.0, 0.0, 0.0, 0.0]),
        ])
    }

    // -------------------------------------------------------------------------
    // YEAR AGGREGATE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_region_year_sums_and_sorts() {
        let rows = region_year(&sample()).unwrap();
        let keys: Vec<(&str, i32)> = rows.iter().map(|r| (r.entity.as_str(), r.year)).collect();
        assert_eq!(
            keys,
            vec![("AK", 2021), ("OK", 2020), ("TX", 2020), ("TX", 2021), ("Unknown", 2021)]
        );
        let tx_2020 = &rows[2];
        assert_eq!(tx_2020.totals.total_emissions, 150.0);
        assert_eq!(tx_2020.totals.co2, 100.0);
        assert_eq!(tx_2020.totals.ch4, 40.0);
        assert_eq!(tx_2020.totals.n2o, 3.0);
        assert_eq!(tx_2020.facility_count, 2);
    }

    #[test]
    fn test_sector_year_labels_missing_sector_unknown() {
        let rows = sector_year(&sample()).unwrap();
        let unknown = rows.iter().find(|r| r.entity == UNKNOWN_ENTITY).unwrap();
        assert_eq!(unknown.year, 2021);
        assert_eq!(unknown.totals.ch4, 7.0);
        assert_eq!(EntityKind::Sector.id_column(), "sector");
    }

    #[test]
    fn test_mass_conservation_per_year() {
        let table = sample();
        let national = national_totals(&table);
        assert_eq!(national.len(), 2);
        assert_eq!(national[0].total_emissions, 180.0);
        for kind in [EntityKind::Region, EntityKind::Sector] {
            let rows = aggregate_by_year(&table, kind).unwrap();
            assert!(conservation_mismatches(&rows, &national).is_empty());
            for n in &national {
                let summed: f64 = rows.iter().filter(|r| r.year == n.year).map(|r| r.totals.total_emissions).sum();
                assert!((summed - n.total_emissions).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_conservation_mismatch_detected() {
        let table = sample();
        let mut rows = region_year(&table).unwrap();
        rows.pop();
        assert_eq!(conservation_mismatches(&rows, &national_totals(&table)), vec![2021]);
    }

    #[test]
    fn test_empty_table_is_computation_failure() {
        let err = region_year(&cleaned(Vec::new())).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput(_)));
        assert!(entity_features(&cleaned(Vec::new()), EntityKind::Sector).is_err());
    }

    // -------------------------------------------------------------------------
    // FEATURE VECTOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_entity_features_derivations() {
        let features = entity_features(&sample(), EntityKind::Region).unwrap();
        let tx = features.iter().find(|f| f.entity == "TX").unwrap();
        assert_eq!(tx.facility_count, 3);
        assert_eq!(tx.totals.total_emissions, 230.0);
        assert!((tx.mean_emissions_per_facility - 230.0 / 3.0).abs() < 1e-12);
        assert!((tx.share_co2 - 170.0 / 230.0).abs() < 1e-12);
        assert!((tx.share_ch4 - 44.0 / 230.0).abs() < 1e-12);
        for f in &features {
            for share in [f.share_co2, f.share_ch4, f.share_n2o] {
                assert!((0.0..=1.0).contains(&share));
            }
        }
    }

    #[test]
    fn test_zero_total_entity_has_zero_shares() {
        let features = entity_features(&sample(), EntityKind::Region).unwrap();
        let ak = features.iter().find(|f| f.entity == "AK").unwrap();
        assert_eq!(ak.mean_emissions_per_facility, 0.0);
        assert_eq!((ak.share_co2, ak.share_ch4, ak.share_n2o), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_zero_total_with_species_mass_has_zero_shares() {
        let table = cleaned(vec![
            record("1", Some("TX"), None, 2012, [0.0, 500.0, 3.0, 0.0]),
            record("2", Some("OK"), None, 2012, [10.0, 40.0, 1.0, 0.5]),
        ]);
        let features = entity_features(&table, EntityKind::Region).unwrap();

        let tx = features.iter().find(|f| f.entity == "TX").unwrap();
        assert_eq!((tx.share_co2, tx.share_ch4, tx.share_n2o), (0.0, 0.0, 0.0));
        assert_eq!(tx.totals.co2, 500.0);

        // Species larger than the reported total stay within [0, 1].
        let ok = features.iter().find(|f| f.entity == "OK").unwrap();
        assert_eq!(ok.share_co2, 1.0);
        assert!((ok.share_ch4 - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_shares_are_per_entity_not_normalized() {
        // total includes species not tracked separately, so shares sum below 1.
        let table = cleaned(vec![record("9", Some("WV"), None, 2022, [100.0, 40.0, 10.0, 5.0])]);
        let f = &entity_features(&table, EntityKind::Region).unwrap()[0];
        assert!((f.share_co2 + f.share_ch4 + f.share_n2o - 0.55).abs() < 1e-12);
    }

    #[test]
    fn test_feature_table_layout() {
        let features = entity_features(&sample(), EntityKind::Sector).unwrap();
        let table = feature_table(&features, EntityKind::Sector).unwrap();
        assert_eq!(table.id_column, "sector");
        assert_eq!(table.ids.len(), features.len());
        let names: Vec<&str> = table.numeric_columns().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, FEATURE_COLUMNS.to_vec());
    }

    #[test]
    fn test_facility_export_projects_present_columns() {
        let mut table = sample();
        table.required_columns = vec!["facility_id".to_string(), "state".to_string()];
        let (header, rows) = facility_export(&table);
        assert_eq!(header, vec!["facility_id", "state"]);
        assert_eq!(rows[4], vec!["4".to_string(), String::new()]);
    }

    // -------------------------------------------------------------------------
    // END-TO-END SCENARIOS
    // -------------------------------------------------------------------------

    fn raw_year(year: i32, rows: Vec<Vec<Data>>) -> RawTable {
        RawTable {
            source: PathBuf::from(format!("ghgp_data_{}.xlsx", year)),
            year,
            sheet: "Direct Emitters".to_string(),
            header_row: 3,
            headers: [
                "Facility Id",
                "State",
                "Total reported direct emissions",
                "CO2 emissions (non-biogenic) ",
                "reporting_year",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            rows,
        }
    }

    fn row(id: Option<f64>, state: &str, total: f64, co2: f64, year: i32) -> Vec<Data> {
        vec![
            id.map(Data::Float).unwrap_or(Data::Empty),
            Data::String(state.to_string()),
            Data::Float(total),
            Data::Float(co2),
            Data::Int(i64::from(year)),
        ]
    }

    #[test]
    fn test_two_years_negative_and_missing_id() {
        let y1 = raw_year(
            2019,
            vec![
                row(Some(1.0), "Texas", 100.0, 80.0, 2019),
                row(Some(2.0), "TX", 50.0, -5.0, 2019),
                row(Some(3.0), "Oklahoma", 20.0, 15.0, 2019),
            ],
        );
        let y2 = raw_year(
            2020,
            vec![
                row(Some(1.0), "TX", 90.0, 70.0, 2020),
                row(None, "TX", 1000.0, 900.0, 2020),
                row(Some(3.0), "OK", 25.0, 20.0, 2020),
            ],
        );

        let (table, report) = clean_tables(&[y1, y2]).unwrap();
        assert_eq!(report.dropped_missing_id, 1);
        assert_eq!(table.len(), 5);
        let negative = table
            .records
            .iter()
            .find(|r| r.facility_id == "2")
            .unwrap();
        assert_eq!(negative.co2_emissions_non_biogenic, 0.0);

        let rows = region_year(&table).unwrap();
        let tx_2019 = rows.iter().find(|r| r.entity == "TX" && r.year == 2019).unwrap();
        assert_eq!(tx_2019.totals.total_emissions, 150.0);
        assert_eq!(tx_2019.totals.co2, 80.0);
        let tx_2020 = rows.iter().find(|r| r.entity == "TX" && r.year == 2020).unwrap();
        assert_eq!(tx_2020.totals.total_emissions, 90.0);
        assert_eq!(tx_2020.facility_count, 1);

        let national = national_totals(&table);
        assert!(conservation_mismatches(&rows, &national).is_empty());
    }

    #[test]
    fn test_features_feed_similarity() {
        let features = entity_features(&sample(), EntityKind::Region).unwrap();
        let sim = cosine_similarity_matrix(&feature_table(&features, EntityKind::Region).unwrap()).unwrap();
        assert_eq!(sim.entities, vec!["AK", "OK", "TX", "Unknown"]);
        for i in 0..sim.len() {
            assert_eq!(sim.get(i, i), 1.0);
        }
    }
}
