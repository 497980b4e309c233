//! Image classification
//!
//! `Classifier` is the seam for a real model. `HeuristicClassifier` is the
//! built-in fallback: file-name patterns first, then the hour and weekday
//! the picture was taken.

use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use regex::{Regex, RegexBuilder};

use crate::error::{Result, ScanError};
use crate::models::{Category, Detection};

/// What the classifier may look at besides the pixels
#[derive(Debug, Clone, Copy)]
pub struct ClassifyHints<'a> {
    pub file_name: &'a str,
    pub size: u64,
    /// Capture time, or file time when there is none, in milliseconds
    pub timestamp: i64,
}

/// Classifier output for one image
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub confidence: f32,
    pub id_document_detections: Vec<Detection>,
    pub general_detections: Vec<Detection>,
}

impl Classification {
    pub fn new(category: Category, confidence: f32) -> Self {
        Self {
            category,
            confidence,
            id_document_detections: Vec::new(),
            general_detections: Vec::new(),
        }
    }
}

/// Assigns a category to an image
pub trait Classifier: Send + Sync {
    /// Fails with `Unavailable` when the classifier cannot run at all
    fn ready(&self) -> Result<()> {
        Ok(())
    }

    /// Classify one image; an error only affects this image
    fn classify(&self, uri: &str, hints: &ClassifyHints<'_>) -> Result<Classification>;
}

struct NameRule {
    category: Category,
    confidence: f32,
    pattern: Regex,
}

/// Rule-based classifier using file names and capture times
pub struct HeuristicClassifier {
    leading: Vec<NameRule>,
    people: NameRule,
    game: NameRule,
}

const WECHAT: &str = r"wechat|微信|screenshot|截图|IMG_\d{8}_\d{6}|Screenshot_\d{8}-\d{6}";
const DOCUMENT: &str =
    r"(^|[^a-z])id([^a-z]|$)|身份证|passport|护照|license|驾照|card|卡|document|文档|scan|扫描";
const FOOD: &str = r"food|meal|dinner|lunch|breakfast|snack|restaurant|cafe|kitchen|cooking|recipe|美食|餐厅|厨房|烹饪|菜谱|食物";
const TRAVEL: &str = r"travel|trip|vacation|holiday|tour|journey|landscape|scenery|view|sight|monument|旅行|旅游|假期|风景|景点|地标";
const PET: &str = r"pet|dog|cat|puppy|kitten|animal|宠物|狗|猫|动物";
const PEOPLE: &str = r"portrait|人像|selfie|自拍|photo|照片|camera|相机|DSC\d{5}";
const GAME: &str = r"game|gaming|capture|play|游戏|捕获|游玩";

fn rule(category: Category, confidence: f32, pattern: &str) -> Result<NameRule> {
    let pattern = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ScanError::unavailable(format!("Bad {} rule: {}", category, e)))?;
    Ok(NameRule {
        category,
        confidence,
        pattern,
    })
}

impl HeuristicClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            leading: vec![
                rule(Category::Wechat, 0.95, WECHAT)?,
                rule(Category::Document, 0.90, DOCUMENT)?,
                rule(Category::Food, 0.88, FOOD)?,
                rule(Category::Travel, 0.85, TRAVEL)?,
                rule(Category::Pet, 0.82, PET)?,
            ],
            people: rule(Category::People, 0.70, PEOPLE)?,
            game: rule(Category::Game, 0.65, GAME)?,
        })
    }

    fn matching<'r>(rule: &'r NameRule, file_name: &str) -> Option<&'r NameRule> {
        rule.pattern.is_match(file_name).then_some(rule)
    }
}

fn is_meeting_time(hour: u32, weekday: Weekday) -> bool {
    let workday = !matches!(weekday, Weekday::Sat | Weekday::Sun);
    workday && ((9..=12).contains(&hour) || (14..=17).contains(&hour))
}

fn is_life_time(hour: u32, weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun) || !(9..=18).contains(&hour)
}

impl Classifier for HeuristicClassifier {
    fn classify(&self, _uri: &str, hints: &ClassifyHints<'_>) -> Result<Classification> {
        let name = hints.file_name;

        if let Some(hit) = self
            .leading
            .iter()
            .find_map(|r| Self::matching(r, name))
        {
            return Ok(Classification::new(hit.category, hit.confidence));
        }

        let taken: DateTime<Local> = DateTime::from_timestamp_millis(hints.timestamp)
            .ok_or_else(|| {
                ScanError::classify_error(None, format!("Bad timestamp {}", hints.timestamp))
            })?
            .with_timezone(&Local);
        let (hour, weekday) = (taken.hour(), taken.weekday());

        if is_meeting_time(hour, weekday) {
            return Ok(Classification::new(Category::Meeting, 0.80));
        }
        if is_life_time(hour, weekday) {
            return Ok(Classification::new(Category::Life, 0.75));
        }
        if let Some(hit) = Self::matching(&self.people, name).or(Self::matching(&self.game, name)) {
            return Ok(Classification::new(hit.category, hit.confidence));
        }

        Ok(Classification::new(Category::Other, 0.50))
    }
}
