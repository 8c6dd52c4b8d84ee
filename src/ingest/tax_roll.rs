//! Tabular source ingestion with column auto-detection.
//!
//! Handles the three county feeds: the full tax roll, the adjudicated
//! list, and geo shape exports (lat/lng per parcel). Header names vary
//! per parish, so columns are matched against alias lists. Row-level
//! failures are counted and never abort the batch.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use super::resolver::{EntityResolver, IngestRecord};
use crate::store::Store;

/// Standard column roles the detector maps headers onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    ParcelId,
    OwnerName,
    MailingAddress,
    MailingZip,
    Phone,
    Email,
    SitusAddress,
    SitusCity,
    SitusState,
    SitusZip,
    LandValue,
    ImprovementValue,
    Acres,
    Adjudicated,
    YearsDelinquent,
    Latitude,
    Longitude,
    Geometry,
}

fn aliases(column: Column) -> &'static [&'static str] {
    match column {
        Column::ParcelId => &[
            "parcel_id",
            "parcel",
            "parcel_number",
            "parcelno",
            "assessment_no",
            "assessment_number",
            "taxparcel",
            "pin",
        ],
        Column::OwnerName => &["owner_name", "owner", "taxpayer", "taxpayer_name", "name"],
        Column::MailingAddress => &[
            "mailing_address",
            "mail_address",
            "owner_address",
            "taxpayer_address",
        ],
        Column::MailingZip => &["mailing_zip", "mail_zip", "owner_zip", "taxpayer_zip", "zip"],
        Column::Phone => &["phone", "phone_number", "owner_phone", "telephone"],
        Column::Email => &["email", "owner_email", "email_address"],
        Column::SitusAddress => &[
            "situs_address",
            "property_address",
            "site_address",
            "physical_address",
            "location",
        ],
        Column::SitusCity => &["situs_city", "property_city", "city"],
        Column::SitusState => &["situs_state", "property_state", "state"],
        Column::SitusZip => &["situs_zip", "property_zip", "postal_code", "site_zip"],
        Column::LandValue => &[
            "land_assessed_value",
            "land_value",
            "assessed_land",
            "land_assessment",
        ],
        Column::ImprovementValue => &[
            "improvement_assessed_value",
            "improvement_value",
            "assessed_improvement",
            "improvements",
        ],
        Column::Acres => &["lot_size_acres", "acres", "acreage", "lot_acres", "land_acres"],
        Column::Adjudicated => &["is_adjudicated", "adjudicated", "adjudication_status"],
        Column::YearsDelinquent => &[
            "years_tax_delinquent",
            "years_delinquent",
            "delinquent_years",
            "tax_years_due",
        ],
        Column::Latitude => &["latitude", "lat", "y"],
        Column::Longitude => &["longitude", "lng", "lon", "x"],
        Column::Geometry => &["geometry", "wkt", "shape", "geom"],
    }
}

fn normalize_header(h: &str) -> String {
    h.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Map header positions onto column roles. First alias match wins per
/// role; a header is consumed by at most one role.
fn detect_columns(headers: &csv::StringRecord) -> HashMap<Column, usize> {
    let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
    let mut mapping = HashMap::new();
    let mut used = vec![false; normalized.len()];

    let roles = [
        Column::ParcelId,
        Column::OwnerName,
        Column::MailingAddress,
        Column::MailingZip,
        Column::Phone,
        Column::Email,
        Column::SitusAddress,
        Column::SitusCity,
        Column::SitusState,
        Column::SitusZip,
        Column::LandValue,
        Column::ImprovementValue,
        Column::Acres,
        Column::Adjudicated,
        Column::YearsDelinquent,
        Column::Latitude,
        Column::Longitude,
        Column::Geometry,
    ];

    'role: for role in roles {
        for alias in aliases(role) {
            for (idx, header) in normalized.iter().enumerate() {
                if header == alias && !used[idx] {
                    mapping.insert(role, idx);
                    used[idx] = true;
                    continue 'role;
                }
            }
        }
    }
    mapping
}

fn get_str(record: &csv::StringRecord, mapping: &HashMap<Column, usize>, col: Column) -> Option<String> {
    mapping
        .get(&col)
        .and_then(|idx| record.get(*idx))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn get_f64(record: &csv::StringRecord, mapping: &HashMap<Column, usize>, col: Column) -> Option<f64> {
    get_str(record, mapping, col)
        .map(|s| s.replace(['$', ','], ""))
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn get_i64(record: &csv::StringRecord, mapping: &HashMap<Column, usize>, col: Column) -> Option<i64> {
    get_f64(record, mapping, col).map(|v| v as i64)
}

fn get_bool(record: &csv::StringRecord, mapping: &HashMap<Column, usize>, col: Column) -> Option<bool> {
    get_str(record, mapping, col).map(|s| {
        matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "adjudicated"
        )
    })
}

/// Statistics from one ingestion run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestionStats {
    pub rows_processed: usize,
    pub rows_skipped: usize,
    pub created_parcels: usize,
    pub updated_parcels: usize,
    pub created_parties: usize,
    pub created_owners: usize,
    pub created_leads: usize,
    pub errors: usize,
    pub error_samples: Vec<String>,
}

impl IngestionStats {
    fn record_error(&mut self, row: usize, err: &anyhow::Error) {
        self.errors += 1;
        if self.error_samples.len() < 10 {
            self.error_samples.push(format!("row {row}: {err:#}"));
        }
    }
}

/// Ingest a tax roll CSV: full parcel + owner + lead resolution.
pub async fn ingest_tax_roll(
    store: &Store,
    path: &Path,
    market_code: &str,
    parish: &str,
) -> Result<IngestionStats> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open tax roll {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mapping = detect_columns(&headers);

    if !mapping.contains_key(&Column::ParcelId) {
        anyhow::bail!("no parcel id column detected in {}", path.display());
    }
    info!(
        file = %path.display(),
        mapped = mapping.len(),
        "tax roll column mapping detected"
    );

    let resolver = EntityResolver::new(store.clone());
    let mut stats = IngestionStats::default();

    for (row_idx, row) in reader.records().enumerate() {
        let record = match row {
            Ok(r) => r,
            Err(e) => {
                stats.record_error(row_idx, &e.into());
                continue;
            }
        };
        stats.rows_processed += 1;

        let Some(raw_parcel_id) = get_str(&record, &mapping, Column::ParcelId) else {
            stats.rows_skipped += 1;
            continue;
        };

        let ingest = IngestRecord {
            raw_parcel_id,
            parish: parish.to_string(),
            market_code: market_code.to_string(),
            owner_name: get_str(&record, &mapping, Column::OwnerName),
            mailing_address: get_str(&record, &mapping, Column::MailingAddress),
            mailing_zip: get_str(&record, &mapping, Column::MailingZip),
            phone: get_str(&record, &mapping, Column::Phone),
            email: get_str(&record, &mapping, Column::Email),
            situs_address: get_str(&record, &mapping, Column::SitusAddress),
            city: get_str(&record, &mapping, Column::SitusCity),
            state: get_str(&record, &mapping, Column::SitusState),
            postal_code: get_str(&record, &mapping, Column::SitusZip),
            land_assessed_value: get_f64(&record, &mapping, Column::LandValue),
            improvement_assessed_value: get_f64(&record, &mapping, Column::ImprovementValue),
            lot_size_acres: get_f64(&record, &mapping, Column::Acres),
            is_adjudicated: get_bool(&record, &mapping, Column::Adjudicated),
            years_tax_delinquent: get_i64(&record, &mapping, Column::YearsDelinquent),
            raw_data: None,
        };

        match resolver.resolve(&ingest).await {
            Ok(row_stats) => {
                if row_stats.created_parcel {
                    stats.created_parcels += 1;
                } else {
                    stats.updated_parcels += 1;
                }
                if row_stats.created_party {
                    stats.created_parties += 1;
                }
                if row_stats.created_owner {
                    stats.created_owners += 1;
                }
                if row_stats.created_lead {
                    stats.created_leads += 1;
                }
            }
            Err(e) => {
                warn!(row = row_idx, error = %e, "tax roll row failed");
                stats.record_error(row_idx, &e);
            }
        }
    }

    info!(
        processed = stats.rows_processed,
        created_leads = stats.created_leads,
        errors = stats.errors,
        "tax roll ingestion complete"
    );
    Ok(stats)
}

/// Ingest an adjudicated list: marks parcels adjudicated and records
/// delinquency years. Parcels not yet present are created bare.
pub async fn ingest_adjudicated_list(
    store: &Store,
    path: &Path,
    market_code: &str,
    parish: &str,
) -> Result<IngestionStats> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open adjudicated list {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mapping = detect_columns(&headers);

    if !mapping.contains_key(&Column::ParcelId) {
        anyhow::bail!("no parcel id column detected in {}", path.display());
    }

    let resolver = EntityResolver::new(store.clone());
    let mut stats = IngestionStats::default();

    for (row_idx, row) in reader.records().enumerate() {
        let record = match row {
            Ok(r) => r,
            Err(e) => {
                stats.record_error(row_idx, &e.into());
                continue;
            }
        };
        stats.rows_processed += 1;

        let Some(raw_parcel_id) = get_str(&record, &mapping, Column::ParcelId) else {
            stats.rows_skipped += 1;
            continue;
        };

        let ingest = IngestRecord {
            raw_parcel_id,
            parish: parish.to_string(),
            market_code: market_code.to_string(),
            owner_name: get_str(&record, &mapping, Column::OwnerName),
            mailing_zip: get_str(&record, &mapping, Column::MailingZip),
            is_adjudicated: Some(true),
            years_tax_delinquent: get_i64(&record, &mapping, Column::YearsDelinquent),
            ..Default::default()
        };

        match resolver.resolve(&ingest).await {
            Ok(row_stats) => {
                if row_stats.created_parcel {
                    stats.created_parcels += 1;
                } else {
                    stats.updated_parcels += 1;
                }
                if row_stats.created_lead {
                    stats.created_leads += 1;
                }
            }
            Err(e) => {
                warn!(row = row_idx, error = %e, "adjudicated row failed");
                stats.record_error(row_idx, &e);
            }
        }
    }

    Ok(stats)
}

/// Ingest geo shapes: lat/lng (and optional geometry) per parcel.
pub async fn ingest_geo_shapes(store: &Store, path: &Path) -> Result<IngestionStats> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open geo shapes {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mapping = detect_columns(&headers);

    if !mapping.contains_key(&Column::ParcelId)
        || !mapping.contains_key(&Column::Latitude)
        || !mapping.contains_key(&Column::Longitude)
    {
        anyhow::bail!("geo shapes need parcel id, latitude and longitude columns");
    }

    let mut stats = IngestionStats::default();

    for (row_idx, row) in reader.records().enumerate() {
        let record = match row {
            Ok(r) => r,
            Err(e) => {
                stats.record_error(row_idx, &e.into());
                continue;
            }
        };
        stats.rows_processed += 1;

        let Some(raw_parcel_id) = get_str(&record, &mapping, Column::ParcelId) else {
            stats.rows_skipped += 1;
            continue;
        };
        let (Some(lat), Some(lng)) = (
            get_f64(&record, &mapping, Column::Latitude),
            get_f64(&record, &mapping, Column::Longitude),
        ) else {
            stats.rows_skipped += 1;
            continue;
        };

        let canonical = super::canonical_parcel_id(&raw_parcel_id);
        let geometry = get_str(&record, &mapping, Column::Geometry);
        match store
            .set_parcel_location(&canonical, lat, lng, geometry.as_deref())
            .await
        {
            Ok(true) => stats.updated_parcels += 1,
            Ok(false) => stats.rows_skipped += 1,
            Err(e) => stats.record_error(row_idx, &e),
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn header_detection_handles_aliases() {
        let headers = csv::StringRecord::from(vec![
            "Parcel Number",
            "Taxpayer Name",
            "Mailing Zip",
            "Land Value",
            "Acreage",
        ]);
        let mapping = detect_columns(&headers);
        assert_eq!(mapping.get(&Column::ParcelId), Some(&0));
        assert_eq!(mapping.get(&Column::OwnerName), Some(&1));
        assert_eq!(mapping.get(&Column::MailingZip), Some(&2));
        assert_eq!(mapping.get(&Column::LandValue), Some(&3));
        assert_eq!(mapping.get(&Column::Acres), Some(&4));
    }

    #[tokio::test]
    async fn tax_roll_roundtrip_and_reingest() {
        let (store, _file) = temp_store();
        let csv_file = write_csv(
            "parcel_number,taxpayer_name,mailing_zip,land_value,improvement_value,acreage,phone\n\
             12-34,John Doe,70801,40000,0,2.0,(225) 555-0147\n\
             56-78,Jane Roe,70802,\"$15,000\",5000,0.8,225-555-0199\n\
             ,No Parcel,70803,1,1,1,\n",
        );

        let stats = ingest_tax_roll(&store, csv_file.path(), "LA", "East Baton Rouge")
            .await
            .unwrap();
        assert_eq!(stats.rows_processed, 3);
        assert_eq!(stats.rows_skipped, 1);
        assert_eq!(stats.created_parcels, 2);
        assert_eq!(stats.created_leads, 2);
        assert_eq!(stats.errors, 0);

        // Reingest: zero net new rows.
        let before = store.entity_counts().await.unwrap();
        let stats2 = ingest_tax_roll(&store, csv_file.path(), "LA", "East Baton Rouge")
            .await
            .unwrap();
        assert_eq!(stats2.created_parcels, 0);
        assert_eq!(stats2.created_leads, 0);
        let after = store.entity_counts().await.unwrap();
        assert_eq!(before, after);

        // Dollar formatting parsed.
        let parcel = store
            .get_parcel_by_canonical_id("567800000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parcel.land_assessed_value, Some(15_000.0));
    }

    #[tokio::test]
    async fn adjudicated_list_marks_parcels() {
        let (store, _file) = temp_store();
        let tax = write_csv(
            "parcel_number,taxpayer_name,mailing_zip,land_value\n12-34,John Doe,70801,40000\n",
        );
        ingest_tax_roll(&store, tax.path(), "LA", "East Baton Rouge")
            .await
            .unwrap();

        let adj = write_csv("parcel,years_delinquent\n12-34,4\n");
        let stats = ingest_adjudicated_list(&store, adj.path(), "LA", "East Baton Rouge")
            .await
            .unwrap();
        assert_eq!(stats.updated_parcels, 1);

        let parcel = store
            .get_parcel_by_canonical_id("123400000000")
            .await
            .unwrap()
            .unwrap();
        assert!(parcel.is_adjudicated);
        assert_eq!(parcel.years_tax_delinquent, 4);
    }

    #[tokio::test]
    async fn geo_shapes_set_location() {
        let (store, _file) = temp_store();
        let tax = write_csv("parcel_number,taxpayer_name,mailing_zip\n12-34,John Doe,70801\n");
        ingest_tax_roll(&store, tax.path(), "LA", "East Baton Rouge")
            .await
            .unwrap();

        let geo = write_csv("parcel,lat,lon\n12-34,30.45,-91.14\nmissing,1.0,1.0\n");
        let stats = ingest_geo_shapes(&store, geo.path()).await.unwrap();
        assert_eq!(stats.updated_parcels, 1);
        assert_eq!(stats.rows_skipped, 1);

        let parcel = store
            .get_parcel_by_canonical_id("123400000000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parcel.latitude, Some(30.45));
        assert_eq!(parcel.longitude, Some(-91.14));
    }
}
