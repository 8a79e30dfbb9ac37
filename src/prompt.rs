//! Analysis request model and prompt rendering.
//!
//! Four-pillar values are computed elsewhere (see [`PillarCalculator`]); this
//! module only embeds them into the prompt text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::protocol::chat::ChatCompletionRequest;

/// One pillar: a heavenly stem and an earthly branch, kept as opaque symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pillar {
    pub stem: String,
    pub branch: String,
}

impl Pillar {
    #[must_use]
    pub fn new(stem: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for Pillar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.stem, self.branch)
    }
}

/// Year, month, day and hour pillars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FourPillars {
    pub year: Pillar,
    pub month: Pillar,
    pub day: Pillar,
    pub hour: Pillar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    fn label(self) -> &'static str {
        match self {
            Gender::Male => "男",
            Gender::Female => "女",
        }
    }
}

/// Calendar the birth date was entered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarSystem {
    #[default]
    Solar,
    Lunar,
}

impl CalendarSystem {
    fn label(self) -> &'static str {
        match self {
            CalendarSystem::Solar => "公历",
            CalendarSystem::Lunar => "农历",
        }
    }
}

/// External calendrical library turning a birth moment into four pillars.
pub trait PillarCalculator {
    fn four_pillars(&self, birth_date_time: &str, calendar: CalendarSystem) -> FourPillars;
}

/// Everything needed to ask for one analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub name: String,
    pub gender: Gender,
    /// As entered, e.g. `1990-05-17 08:30`.
    pub birth_date_time: String,
    /// Province, city, district.
    #[serde(default)]
    pub region: Vec<String>,
    #[serde(default)]
    pub calendar: CalendarSystem,
    pub pillars: FourPillars,
}

impl AnalysisRequest {
    /// Build a request, asking `calculator` for the pillars.
    pub fn with_calculator<C: PillarCalculator + ?Sized>(
        calculator: &C,
        name: impl Into<String>,
        gender: Gender,
        birth_date_time: impl Into<String>,
        region: Vec<String>,
        calendar: CalendarSystem,
    ) -> Self {
        let birth_date_time = birth_date_time.into();
        let pillars = calculator.four_pillars(&birth_date_time, calendar);
        Self {
            name: name.into(),
            gender,
            birth_date_time,
            region,
            calendar,
            pillars,
        }
    }

    /// Wire request for the configured model and sampling parameters.
    #[must_use]
    pub fn to_chat_request(&self, config: &AppConfig) -> ChatCompletionRequest {
        ChatCompletionRequest::streaming(&config.upstream.model, build_prompt(self), &config.sampling)
    }
}

/// Render the analysis prompt.
#[must_use]
pub fn build_prompt(request: &AnalysisRequest) -> String {
    let pillars = &request.pillars;
    format!(
        "请根据以下信息进行八字分析。先说明分析推理过程，完成推理后，输出完整的分析结果：

姓名: {name}
性别: {gender}
出生日期时间: {birth}
出生地点: {region}
历法: {calendar}

八字信息：
年柱: {year}
月柱: {month}
日柱: {day}
时柱: {hour}

请从以下几个方面进行分析：
1. 命主身旺弱分析
2. 五行喜忌分析
3. 事业方向建议
4. 健康建议
5. 财运分析
6. 感情分析

注意：
- 分析要客观理性，避免过于绝对化的判断
- 多提供积极正面的建议
- 建议要具体可行，便于实践
- 分析要有理有据，解释清楚原因
- 避免迷信色彩，强调个人努力的重要性",
        name = request.name,
        gender = request.gender.label(),
        birth = request.birth_date_time,
        region = request.region.join(" "),
        calendar = request.calendar.label(),
        year = pillars.year,
        month = pillars.month,
        day = pillars.day,
        hour = pillars.hour,
    )
}
