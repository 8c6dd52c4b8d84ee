//! Optional enrichment capabilities: address verification, geocoding
//! and property-data lookup behind constructor-injected seams.
//!
//! Concrete third-party adapters are wired at the composition root;
//! the ENABLE_USPS / ENABLE_GOOGLE / ENABLE_PROPSTREAM flags select
//! the crate's offline stand-ins. Stand-ins never fabricate data: the
//! property lookup returns nothing, the verifier only standardizes
//! text and never claims DPV confirmation.
//!
//! Verification and geocode results are cached per-process with a
//! TTL. Write races between workers are tolerable: entries are
//! idempotent and derived from their key.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;

/// Postal verification result. `dpv_confirmed` only when a real DPV
/// source said so.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedAddress {
    pub standardized: String,
    pub dpv_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Assessed-value facts from a property-data provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyFacts {
    pub land_assessed_value: Option<f64>,
    pub improvement_assessed_value: Option<f64>,
    pub lot_size_acres: Option<f64>,
}

#[async_trait]
pub trait AddressVerifier: Send + Sync {
    async fn verify(&self, address: &str) -> Result<Option<VerifiedAddress>>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>>;
}

#[async_trait]
pub trait PropertyLookup: Send + Sync {
    async fn lookup(&self, canonical_parcel_id: &str) -> Result<Option<PropertyFacts>>;
}

/// Offline verifier: deterministic standardization (trim, collapse
/// whitespace, uppercase), never DPV-confirmed.
pub struct LocalAddressStandardizer;

#[async_trait]
impl AddressVerifier for LocalAddressStandardizer {
    async fn verify(&self, address: &str) -> Result<Option<VerifiedAddress>> {
        let standardized = address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
        if standardized.is_empty() {
            return Ok(None);
        }
        Ok(Some(VerifiedAddress {
            standardized,
            dpv_confirmed: false,
        }))
    }
}

/// Offline geocoder: county-seat centroids for the default market
/// parishes, nothing else.
pub struct ParishCentroidGeocoder;

const PARISH_CENTROIDS: &[(&str, f64, f64)] = &[
    ("EAST BATON ROUGE", 30.4515, -91.1871),
    ("HARRIS COUNTY", 29.8578, -95.3936),
    ("HINDS COUNTY", 32.2657, -90.2407),
    ("PULASKI COUNTY", 34.7694, -92.3132),
    ("JEFFERSON COUNTY", 33.5446, -86.8956),
];

#[async_trait]
impl Geocoder for ParishCentroidGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let upper = address.to_uppercase();
        Ok(PARISH_CENTROIDS
            .iter()
            .find(|(parish, _, _)| upper.contains(parish))
            .map(|(_, latitude, longitude)| GeoPoint {
                latitude: *latitude,
                longitude: *longitude,
            }))
    }
}

/// Offline property lookup: no data source, so no facts. Real
/// adapters replace this at the composition root.
pub struct OfflinePropertyLookup;

#[async_trait]
impl PropertyLookup for OfflinePropertyLookup {
    async fn lookup(&self, _canonical_parcel_id: &str) -> Result<Option<PropertyFacts>> {
        Ok(None)
    }
}

/// Per-process in-memory cache with TTL. Only hits are cached; a miss
/// re-queries the provider.
pub struct TtlCache<V: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: V) {
        self.entries.lock().insert(key.to_string(), (Instant::now(), value));
    }
}

const CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

/// Capability bundle handed to the pipeline. A capability whose flag
/// is off carries no provider and reports inactive.
pub struct EnrichmentService {
    verifier: Option<Arc<dyn AddressVerifier>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    property_lookup: Option<Arc<dyn PropertyLookup>>,
    usps_cache: TtlCache<VerifiedAddress>,
    geocode_cache: TtlCache<GeoPoint>,
}

impl EnrichmentService {
    pub fn new(
        verifier: Option<Arc<dyn AddressVerifier>>,
        geocoder: Option<Arc<dyn Geocoder>>,
        property_lookup: Option<Arc<dyn PropertyLookup>>,
    ) -> Self {
        Self {
            verifier,
            geocoder,
            property_lookup,
            usps_cache: TtlCache::new(CACHE_TTL),
            geocode_cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// Providers per the feature flags: enabled flags install the
    /// offline stand-ins, which a deployment swaps for real adapters.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .enable_usps
                .then(|| Arc::new(LocalAddressStandardizer) as Arc<dyn AddressVerifier>),
            config
                .enable_google
                .then(|| Arc::new(ParishCentroidGeocoder) as Arc<dyn Geocoder>),
            config
                .enable_propstream
                .then(|| Arc::new(OfflinePropertyLookup) as Arc<dyn PropertyLookup>),
        )
    }

    pub fn verifier_active(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn geocoder_active(&self) -> bool {
        self.geocoder.is_some()
    }

    pub fn lookup_active(&self) -> bool {
        self.property_lookup.is_some()
    }

    /// Cached address verification.
    pub async fn verify_address(&self, address: &str) -> Result<Option<VerifiedAddress>> {
        let Some(verifier) = self.verifier.as_deref() else {
            return Ok(None);
        };
        if let Some(hit) = self.usps_cache.get(address) {
            return Ok(Some(hit));
        }
        let result = verifier.verify(address).await?;
        if let Some(verified) = &result {
            self.usps_cache.put(address, verified.clone());
        }
        Ok(result)
    }

    /// Cached geocode.
    pub async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let Some(geocoder) = self.geocoder.as_deref() else {
            return Ok(None);
        };
        if let Some(hit) = self.geocode_cache.get(address) {
            return Ok(Some(hit));
        }
        let result = geocoder.geocode(address).await?;
        if let Some(point) = result {
            self.geocode_cache.put(address, point);
        }
        Ok(result)
    }

    /// Property facts. Not cached: assessment data changes under the
    /// provider, and lookups are batched nightly anyway.
    pub async fn lookup_property(&self, canonical_parcel_id: &str) -> Result<Option<PropertyFacts>> {
        let Some(lookup) = self.property_lookup.as_deref() else {
            return Ok(None);
        };
        lookup.lookup(canonical_parcel_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, _address: &str) -> Result<Option<GeoPoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(GeoPoint {
                latitude: 1.0,
                longitude: 2.0,
            }))
        }
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache: TtlCache<i64> = TtlCache::new(Duration::from_millis(20));
        cache.put("k", 7);
        assert_eq!(cache.get("k"), Some(7));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn standardizer_normalizes_but_never_confirms() {
        let verified = LocalAddressStandardizer
            .verify("  123   main st  ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verified.standardized, "123 MAIN ST");
        assert!(!verified.dpv_confirmed);

        assert!(LocalAddressStandardizer.verify("   ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn centroid_geocoder_knows_default_parishes() {
        let hit = ParishCentroidGeocoder
            .geocode("123 Oak Ln, East Baton Rouge, LA")
            .await
            .unwrap()
            .unwrap();
        assert!((hit.latitude - 30.4515).abs() < 1e-6);

        assert!(ParishCentroidGeocoder
            .geocode("somewhere in Nevada")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn geocode_results_are_cached() {
        let counting = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let service =
            EnrichmentService::new(None, Some(counting.clone() as Arc<dyn Geocoder>), None);

        assert!(service.geocode("123 Main St").await.unwrap().is_some());
        assert!(service.geocode("123 Main St").await.unwrap().is_some());
        // Second call served from the per-process cache.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inactive_capabilities_return_nothing() {
        let service = EnrichmentService::new(None, None, None);
        assert!(!service.verifier_active());
        assert!(!service.geocoder_active());
        assert!(!service.lookup_active());
        assert!(service.verify_address("123 Main St").await.unwrap().is_none());
        assert!(service.geocode("123 Main St").await.unwrap().is_none());
        assert!(service.lookup_property("ABC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_lookup_fabricates_nothing() {
        assert!(OfflinePropertyLookup.lookup("ABC123").await.unwrap().is_none());
    }

    #[test]
    fn flags_select_providers() {
        let mut config = crate::config::Config::from_env().unwrap();
        config.enable_usps = true;
        config.enable_google = true;
        config.enable_propstream = false;

        let service = EnrichmentService::from_config(&config);
        assert!(service.verifier_active());
        assert!(service.geocoder_active());
        assert!(!service.lookup_active());
    }
}
