//! Guangming Online military channel (`junshi.gmw.cn`).

use crate::scrapers::rules::ExtractionRules;

pub const SOURCE_CODE: &str = "gmw_military";

pub const RULES: ExtractionRules = ExtractionRules {
    title: &["h1", "title"],
    body: &["#contentMain", "#content", ".article", ".wrap", "body"],
    publish_time: &[".time", ".pubTime", ".pub_time", "#pubtime", ".info span"],
    time_layouts: &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d",
        "%Y年%m月%d日 %H:%M",
    ],
    utc_offset_secs: 8 * 3600,
    // `.time` often holds the byline source, not a time
    time_fallthrough: true,
};
