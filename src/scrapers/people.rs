//! People's Daily military channel (`military.people.com.cn`).
//!
//! Article pages keep the body in `#rwb_zw` or `.rm_txt_con` and the byline
//! time in `.rm_txt_time`, written like `2024年03月01日 10:30`.

use crate::scrapers::rules::ExtractionRules;

pub const SOURCE_CODE: &str = "people_military";

pub const RULES: ExtractionRules = ExtractionRules {
    title: &["h1", "title"],
    body: &["#rwb_zw", ".rm_txt_con", ".box_con", ".article", "body"],
    publish_time: &[
        ".rm_txt_time",
        ".souce span",
        "#rwb_zw span",
        ".time",
        ".pub_time",
    ],
    time_layouts: &["%Y年%m月%d日 %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"],
    // China Standard Time
    utc_offset_secs: 8 * 3600,
    time_fallthrough: false,
};
