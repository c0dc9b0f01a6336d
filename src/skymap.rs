// =============================================================================
// Sky maps: multi-order HEALPix probability tables and their sources
// =============================================================================
//
// A sky map is a list of (UNIQ, PROBDENSITY) rows in the NESTED scheme, the
// layout published for gravitational-wave localisations.  Lookup decodes the
// orders present and probes each one with `ang2pix_nest`.
//
// Sources implement `SkyMapSource`; the HTTP source fetches JSON rows and
// caches each table by URL so repeated alerts reuse it.  The cache is
// bounded: entries expire after a TTL and the oldest is evicted when full.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::SkyPosition;

/// One row of a multi-order sky map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyMapPixel {
    pub uniq: u64,
    /// Probability per steradian.
    pub probdensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SkyMapDocument {
    pixels: Vec<SkyMapPixel>,
}

/// Decode a NUNIQ index into (order, nested pixel index).
pub fn uniq_to_order_ipix(uniq: u64) -> Option<(u32, u64)> {
    if uniq < 4 {
        return None;
    }
    let bits = 64 - (uniq / 4).leading_zeros();
    let order = (bits - 1) / 2;
    if order > 29 {
        return None;
    }
    Some((order, uniq - 4 * (1u64 << (2 * order))))
}

fn order_ipix_to_uniq(order: u32, ipix: u64) -> u64 {
    4 * (1u64 << (2 * order)) + ipix
}

/// Spread the low 32 bits of `v` onto even bit positions.
fn spread_bits(v: u64) -> u64 {
    let mut x = v & 0xFFFF_FFFF;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

/// NESTED pixel index for `position` at HEALPix `order`.
pub fn ang2pix_nest(order: u32, position: SkyPosition) -> u64 {
    let nside = 1i64 << order;
    let nside_f = nside as f64;
    let z = position.dec.to_radians().sin();
    let za = z.abs();
    let phi = position.ra.to_radians().rem_euclid(2.0 * PI);
    let tt = phi / FRAC_PI_2; // [0, 4)

    let (face, ix, iy) = if za <= 2.0 / 3.0 {
        // Equatorial region.
        let temp1 = nside_f * (0.5 + tt);
        let temp2 = nside_f * (z * 0.75);
        let jp = (temp1 - temp2) as i64;
        let jm = (temp1 + temp2) as i64;
        let ifp = jp >> order;
        let ifm = jm >> order;
        let face = if ifp == ifm {
            ifp | 4
        } else if ifp < ifm {
            ifp
        } else {
            ifm + 8
        };
        (face, jm & (nside - 1), nside - (jp & (nside - 1)) - 1)
    } else {
        // Polar caps.
        let ntt = (tt as i64).min(3);
        let tp = tt - ntt as f64;
        let tmp = nside_f * (3.0 * (1.0 - za)).sqrt();
        let jp = ((tp * tmp) as i64).min(nside - 1);
        let jm = (((1.0 - tp) * tmp) as i64).min(nside - 1);
        if z >= 0.0 {
            (ntt, nside - jm - 1, nside - jp - 1)
        } else {
            (ntt + 8, jp, jm)
        }
    };

    ((face as u64) << (2 * order)) + spread_bits(ix as u64) + (spread_bits(iy as u64) << 1)
}

// -----------------------------------------------------------------------------
// ProbabilityTable
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProbabilityTable {
    density: HashMap<u64, f64>,
    orders: BTreeSet<u32>,
}

impl ProbabilityTable {
    pub fn from_pixels(pixels: impl IntoIterator<Item = SkyMapPixel>) -> Result<Self> {
        let mut density = HashMap::new();
        let mut orders = BTreeSet::new();
        for pixel in pixels {
            let Some((order, _)) = uniq_to_order_ipix(pixel.uniq) else {
                bail!("invalid UNIQ index {}", pixel.uniq);
            };
            orders.insert(order);
            density.insert(pixel.uniq, pixel.probdensity);
        }
        if density.is_empty() {
            bail!("sky map has no pixels");
        }
        Ok(Self { density, orders })
    }

    pub fn len(&self) -> usize {
        self.density.len()
    }

    /// Probability density (per steradian) of the finest pixel containing
    /// `position`.
    pub fn density_at(&self, position: SkyPosition) -> Option<f64> {
        self.orders.iter().rev().find_map(|&order| {
            let uniq = order_ipix_to_uniq(order, ang2pix_nest(order, position));
            self.density.get(&uniq).copied()
        })
    }

    /// Probability per square degree at `position`, 0 outside the map.
    pub fn probability_per_deg2(&self, position: SkyPosition) -> f64 {
        let sr_per_deg2 = (PI / 180.0).powi(2);
        self.density_at(position).unwrap_or(0.0) * sr_per_deg2
    }
}

// -----------------------------------------------------------------------------
// Sources
// -----------------------------------------------------------------------------

#[async_trait]
pub trait SkyMapSource: Send + Sync {
    /// Fetch (or return a cached) table for `location`.
    async fn fetch(&self, location: &str) -> Result<Arc<ProbabilityTable>>;
}

/// Tables kept before the oldest is evicted.
const CACHE_CAPACITY: usize = 32;
/// A cached table older than this is fetched again.
const CACHE_TTL: Duration = Duration::from_secs(6 * 3600);

struct CachedTable {
    table: Arc<ProbabilityTable>,
    loaded_at: Instant,
}

/// Fetches `{"pixels": [{"uniq", "probdensity"}, ...]}` over HTTP, or from
/// disk for non-URL locations, caching by location.
pub struct HttpSkyMapSource {
    client: reqwest::Client,
    cache: RwLock<HashMap<String, CachedTable>>,
    capacity: usize,
    ttl: Duration,
}

impl HttpSkyMapSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build sky map HTTP client")?;
        Ok(Self {
            client,
            cache: RwLock::new(HashMap::new()),
            capacity: CACHE_CAPACITY,
            ttl: CACHE_TTL,
        })
    }

    pub fn with_cache_limits(mut self, capacity: usize, ttl: Duration) -> Self {
        self.capacity = capacity.max(1);
        self.ttl = ttl;
        self
    }

    fn remember(&self, location: &str, table: Arc<ProbabilityTable>) {
        let mut cache = self.cache.write();
        let ttl = self.ttl;
        cache.retain(|_, c| c.loaded_at.elapsed() < ttl);
        while cache.len() >= self.capacity {
            let oldest = cache
                .iter()
                .min_by_key(|(_, c)| c.loaded_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!(location = %k, "evicting sky map from cache");
                    cache.remove(&k);
                }
                None => break,
            }
        }
        cache.insert(
            location.to_string(),
            CachedTable {
                table,
                loaded_at: Instant::now(),
            },
        );
    }

    async fn download(&self, location: &str) -> Result<SkyMapDocument> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let resp = self
                .client
                .get(location)
                .send()
                .await
                .with_context(|| format!("GET {} failed", location))?;
            let status = resp.status();
            if !status.is_success() {
                bail!("sky map request to {} returned {}", location, status);
            }
            resp.json::<SkyMapDocument>()
                .await
                .with_context(|| format!("failed to decode sky map from {}", location))
        } else {
            let content = tokio::fs::read_to_string(location)
                .await
                .with_context(|| format!("failed to read sky map {}", location))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse sky map {}", location))
        }
    }
}

#[async_trait]
impl SkyMapSource for HttpSkyMapSource {
    async fn fetch(&self, location: &str) -> Result<Arc<ProbabilityTable>> {
        let cached = self
            .cache
            .read()
            .get(location)
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| c.table.clone());
        if let Some(hit) = cached {
            debug!(location, "sky map cache hit");
            return Ok(hit);
        }

        let doc = self.download(location).await?;
        let table = Arc::new(ProbabilityTable::from_pixels(doc.pixels)?);
        info!(location, pixels = table.len(), "sky map loaded");
        self.remember(location, table.clone());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniq_decodes_order_and_index() {
        assert_eq!(uniq_to_order_ipix(4), Some((0, 0)));
        assert_eq!(uniq_to_order_ipix(15), Some((0, 11)));
        assert_eq!(uniq_to_order_ipix(16), Some((1, 0)));
        assert_eq!(uniq_to_order_ipix(63), Some((1, 47)));
        assert_eq!(uniq_to_order_ipix(3), None);
    }

    #[test]
    fn order_zero_faces_land_where_expected() {
        assert_eq!(ang2pix_nest(0, SkyPosition::new(0.0, 90.0)), 0);
        assert_eq!(ang2pix_nest(0, SkyPosition::new(0.0, 0.0)), 4);
        assert_eq!(ang2pix_nest(0, SkyPosition::new(0.0, -90.0)), 8);
        assert_eq!(ang2pix_nest(0, SkyPosition::new(90.0, 0.0)), 5);
    }

    #[test]
    fn children_share_parent_face() {
        let pos = SkyPosition::new(200.0, -35.0);
        let parent = ang2pix_nest(0, pos);
        for order in 1..8 {
            assert_eq!(ang2pix_nest(order, pos) >> (2 * order), parent);
        }
    }

    #[test]
    fn lookup_probes_every_order_present() {
        let pos = SkyPosition::new(45.0, 10.0);
        let fine = order_ipix_to_uniq(3, ang2pix_nest(3, pos));
        let table = ProbabilityTable::from_pixels([
            SkyMapPixel { uniq: 4, probdensity: 0.1 },
            SkyMapPixel { uniq: fine, probdensity: 50.0 },
        ])
        .unwrap();
        assert_eq!(table.density_at(pos), Some(50.0));
        assert_eq!(table.density_at(SkyPosition::new(10.0, 80.0)), Some(0.1));
        assert_eq!(table.probability_per_deg2(SkyPosition::new(300.0, -80.0)), 0.0);
    }

    #[test]
    fn empty_or_invalid_maps_are_rejected() {
        assert!(ProbabilityTable::from_pixels(Vec::new()).is_err());
        assert!(ProbabilityTable::from_pixels([SkyMapPixel { uniq: 1, probdensity: 1.0 }]).is_err());
    }

    #[tokio::test]
    async fn file_source_parses_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skymap.json");
        std::fs::write(&path, r#"{"pixels": [{"uniq": 4, "probdensity": 2.5}]}"#).unwrap();
        let source = HttpSkyMapSource::new(Duration::from_secs(5)).unwrap();
        let location = path.to_string_lossy().to_string();

        let first = source.fetch(&location).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = source.fetch(&location).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.density_at(SkyPosition::new(10.0, 80.0)), Some(2.5));
    }

    fn write_map(dir: &std::path::Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, r#"{"pixels": [{"uniq": 4, "probdensity": 1.0}]}"#).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn full_cache_evicts_the_oldest_table() {
        let dir = tempfile::tempdir().unwrap();
        let source = HttpSkyMapSource::new(Duration::from_secs(5))
            .unwrap()
            .with_cache_limits(2, Duration::from_secs(3600));
        let a = write_map(dir.path(), "a.json");
        let b = write_map(dir.path(), "b.json");
        let c = write_map(dir.path(), "c.json");

        source.fetch(&a).await.unwrap();
        source.fetch(&b).await.unwrap();
        source.fetch(&c).await.unwrap();

        let cache = source.cache.read();
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key(&a));
        assert!(cache.contains_key(&c));
    }

    #[tokio::test]
    async fn expired_table_is_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let source = HttpSkyMapSource::new(Duration::from_secs(5))
            .unwrap()
            .with_cache_limits(4, Duration::ZERO);
        let location = write_map(dir.path(), "stale.json");

        source.fetch(&location).await.unwrap();
        std::fs::remove_file(&location).unwrap();
        assert!(source.fetch(&location).await.is_err());
    }
}
