//! Substitution tokens used inside layer SQL.
//!
//! Layer queries may contain placeholder tokens (`!bbox!`,
//! `!scale_denominator!`, `!pixel_width!`, `!pixel_height!`) that the
//! render pipeline replaces with concrete fragments. The builders here only
//! need two flavors: replacing with caller-supplied values, and replacing
//! with harmless dummies so a query can be probed for its schema.

#[derive(Debug, Clone, Default)]
pub struct Replacements {
    pub bbox: Option<String>,
    pub scale_denominator: Option<String>,
    pub pixel_width: Option<String>,
    pub pixel_height: Option<String>,
}

pub fn replace(sql: &str, replacements: &Replacements) -> String {
    let mut out = sql.to_string();
    if let Some(bbox) = &replacements.bbox {
        out = out.replace("!bbox!", bbox);
    }
    if let Some(scale) = &replacements.scale_denominator {
        out = out.replace("!scale_denominator!", scale);
    }
    if let Some(w) = &replacements.pixel_width {
        out = out.replace("!pixel_width!", w);
    }
    if let Some(h) = &replacements.pixel_height {
        out = out.replace("!pixel_height!", h);
    }
    out
}

/// Replace every token with a neutral value. Used when a query is executed
/// only to inspect its result shape (`LIMIT 0` probes, row estimates).
pub fn replace_dummy(sql: &str) -> String {
    replace(
        sql,
        &Replacements {
            bbox: Some("ST_MakeEnvelope(0,0,0,0,0)".to_string()),
            scale_denominator: Some("0".to_string()),
            pixel_width: Some("1".to_string()),
            pixel_height: Some("1".to_string()),
        },
    )
}

/// Replace the zoom-dependent tokens for a specific zoom level.
pub fn replace_xyz(sql: &str, zoom: u32, bbox_sql: &str) -> String {
    let scale = crate::mercator::WebMercatorHelper::new().resolution(zoom) / 0.00028;
    replace(
        sql,
        &Replacements {
            bbox: Some(bbox_sql.to_string()),
            scale_denominator: Some(scale.to_string()),
            pixel_width: None,
            pixel_height: None,
        },
    )
}
