//! Nearest-city lookup for GPS coordinates

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, ScanError};

/// Default search radius in kilometers
pub const DEFAULT_MAX_DISTANCE_KM: f64 = 200.0;

/// Default number of cached lookups
pub const DEFAULT_LOOKUP_CACHE_SIZE: usize = 1000;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// The city a coordinate resolved to
#[derive(Debug, Clone, PartialEq)]
pub struct CityMatch {
    pub name: String,
    pub province: String,
    /// Distance to the city center, rounded to two decimals
    pub distance_km: f64,
}

/// Maps a coordinate to the nearest known city
pub trait LocationResolver: Send + Sync {
    /// Returns None when no city lies within range
    fn nearest_city(&self, latitude: f64, longitude: f64) -> Option<CityMatch>;
}

/// One entry of a city table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub province: String,
    pub lat: f64,
    pub lng: f64,
}

type CacheKey = (i64, i64);

#[derive(Default)]
struct LookupCache {
    entries: HashMap<CacheKey, CityMatch>,
    order: VecDeque<CacheKey>,
}

/// Linear nearest-city search with a bounded lookup cache
pub struct CityTable {
    cities: Vec<City>,
    max_distance_km: f64,
    cache_capacity: usize,
    cache: Mutex<LookupCache>,
}

impl CityTable {
    pub fn new(cities: Vec<City>) -> Self {
        Self {
            cities,
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            cache_capacity: DEFAULT_LOOKUP_CACHE_SIZE,
            cache: Mutex::new(LookupCache::default()),
        }
    }

    /// Table of major Chinese cities shipped with the crate
    pub fn builtin() -> Self {
        let cities = BUILTIN_CITIES
            .iter()
            .map(|&(name, province, lat, lng)| City {
                name: name.to_string(),
                province: province.to_string(),
                lat,
                lng,
            })
            .collect();
        Self::new(cities)
    }

    /// Load a JSON array of `{name, province, lat, lng}`
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::io_error(Some(path.to_path_buf()), e.to_string()))?;
        let cities: Vec<City> = serde_json::from_str(&text).map_err(|e| {
            ScanError::invalid_input(format!("Invalid city table {}: {}", path.display(), e))
        })?;
        Ok(Self::new(cities))
    }

    pub fn with_max_distance(mut self, km: f64) -> Self {
        self.max_distance_km = km;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty()
    }

    /// Number of cached lookups
    pub fn cached_lookups(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    fn search(&self, latitude: f64, longitude: f64) -> Option<CityMatch> {
        self.cities
            .iter()
            .map(|city| (city, haversine_km(latitude, longitude, city.lat, city.lng)))
            .filter(|(_, d)| *d <= self.max_distance_km)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(city, d)| CityMatch {
                name: city.name.clone(),
                province: city.province.clone(),
                distance_km: (d * 100.0).round() / 100.0,
            })
    }
}

impl LocationResolver for CityTable {
    fn nearest_city(&self, latitude: f64, longitude: f64) -> Option<CityMatch> {
        if !is_valid_coordinate(latitude, longitude) {
            log::warn!("Invalid coordinates: {}, {}", latitude, longitude);
            return None;
        }

        // Two decimals is roughly a kilometer
        let key = (
            (latitude * 100.0).round() as i64,
            (longitude * 100.0).round() as i64,
        );
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.entries.get(&key) {
                return Some(hit.clone());
            }
        }

        let found = self.search(latitude, longitude)?;

        if let Ok(mut cache) = self.cache.lock() {
            if !cache.entries.contains_key(&key) {
                while cache.entries.len() >= self.cache_capacity {
                    match cache.order.pop_front() {
                        Some(oldest) => {
                            cache.entries.remove(&oldest);
                        }
                        None => break,
                    }
                }
                cache.order.push_back(key);
                cache.entries.insert(key, found.clone());
            }
        }
        Some(found)
    }
}

pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Great-circle distance in kilometers
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

const BUILTIN_CITIES: &[(&str, &str, f64, f64)] = &[
    ("北京", "北京", 39.9042, 116.4074),
    ("上海", "上海", 31.2304, 121.4737),
    ("天津", "天津", 39.3434, 117.3616),
    ("重庆", "重庆", 29.5630, 106.5516),
    ("广州", "广东", 23.1291, 113.2644),
    ("深圳", "广东", 22.5431, 114.0579),
    ("杭州", "浙江", 30.2741, 120.1551),
    ("南京", "江苏", 32.0603, 118.7969),
    ("苏州", "江苏", 31.2990, 120.5853),
    ("武汉", "湖北", 30.5928, 114.3055),
    ("成都", "四川", 30.5728, 104.0668),
    ("西安", "陕西", 34.3416, 108.9398),
    ("郑州", "河南", 34.7466, 113.6254),
    ("长沙", "湖南", 28.2282, 112.9388),
    ("济南", "山东", 36.6512, 117.1201),
    ("青岛", "山东", 36.0671, 120.3826),
    ("沈阳", "辽宁", 41.8057, 123.4315),
    ("大连", "辽宁", 38.9140, 121.6147),
    ("哈尔滨", "黑龙江", 45.8038, 126.5349),
    ("长春", "吉林", 43.8171, 125.3235),
    ("石家庄", "河北", 38.0428, 114.5149),
    ("太原", "山西", 37.8706, 112.5489),
    ("合肥", "安徽", 31.8206, 117.2272),
    ("福州", "福建", 26.0745, 119.2965),
    ("厦门", "福建", 24.4798, 118.0894),
    ("南昌", "江西", 28.6820, 115.8579),
    ("昆明", "云南", 25.0389, 102.7183),
    ("贵阳", "贵州", 26.6470, 106.6302),
    ("南宁", "广西", 22.8170, 108.3665),
    ("海口", "海南", 20.0440, 110.1999),
    ("兰州", "甘肃", 36.0611, 103.8343),
    ("西宁", "青海", 36.6171, 101.7782),
    ("银川", "宁夏", 38.4872, 106.2309),
    ("呼和浩特", "内蒙古", 40.8424, 111.7490),
    ("乌鲁木齐", "新疆", 43.8256, 87.6168),
    ("拉萨", "西藏", 29.6525, 91.1721),
    ("香港", "香港", 22.3193, 114.1694),
    ("澳门", "澳门", 22.1987, 113.5439),
    ("台北", "台湾", 25.0330, 121.5654),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_city_in_range() {
        let table = CityTable::builtin();
        let hit = table.nearest_city(39.91, 116.40).unwrap();
        assert_eq!(hit.name, "北京");
        assert_eq!(hit.province, "北京");
        assert!(hit.distance_km < 5.0);
    }

    #[test]
    fn test_out_of_range_and_invalid() {
        let table = CityTable::builtin();
        assert_eq!(table.nearest_city(0.0, -160.0), None);
        assert_eq!(table.nearest_city(95.0, 10.0), None);
        assert_eq!(table.nearest_city(f64::NAN, 10.0), None);
    }

    #[test]
    fn test_lookup_cache_is_bounded() {
        let table = CityTable::builtin().with_cache_capacity(2);
        table.nearest_city(39.91, 116.40);
        table.nearest_city(39.91, 116.40);
        assert_eq!(table.cached_lookups(), 1);

        table.nearest_city(31.23, 121.47);
        table.nearest_city(23.13, 113.26);
        assert_eq!(table.cached_lookups(), 2);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Beijing to Shanghai is roughly 1067 km
        let d = haversine_km(39.9042, 116.4074, 31.2304, 121.4737);
        assert!((d - 1067.0).abs() < 10.0);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cities.json");
        std::fs::write(
            &path,
            r#"[{"name": "Zurich", "province": "ZH", "lat": 47.3769, "lng": 8.5417}]"#,
        )
        .unwrap();

        let table = CityTable::from_json_file(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.nearest_city(47.37, 8.54).unwrap().name, "Zurich");
    }
}
