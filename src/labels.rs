use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::WsiRecord;
use crate::error::AnnotError;

pub const DATASET_APL: i64 = 1;
pub const DATASET_AML: i64 = 2;
pub const DATASET_HEALTHY: i64 = 3;

static AML_SLIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pat\d+-slide(?: |r|-)?\d+(?:(?:-|\.)([^-]+))?(?:-([a-z]+))?").unwrap()
});
static REGISTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)-(AML|Napoleon)-Register-((\d+)-)?").unwrap());
static AIDA_2000: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(.+)-AIDA-?2000-?(\d+)").unwrap());
static PAT_SLIDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Pat(\d+)(?:-|_)(?:Slide ?)?(\d+)(?:-|\.)((M\d|not_?classified)-)?").unwrap()
});

const JUNK_LABELS: [&str; 5] = ["50x.png", "al", "ap", "bal", "m445501"];

pub fn parse_wsi_labels(dataset_id: i64, img_name: &str) -> Result<BTreeSet<String>, AnnotError> {
    let labels = match dataset_id {
        DATASET_HEALTHY => Some(set(["healthy"])),
        DATASET_AML => parse_aml_slide(img_name),
        DATASET_APL => parse_apl_slide(img_name),
        _ => None,
    };
    labels.ok_or_else(|| AnnotError::InvalidWsiName {
        dataset_id,
        img_name: img_name.to_string(),
    })
}

fn parse_aml_slide(img_name: &str) -> Option<BTreeSet<String>> {
    let caps = AML_SLIDE.captures(img_name)?;
    let mut labels = set(["aml"]);
    labels.extend(
        [caps.get(1), caps.get(2)]
            .into_iter()
            .flatten()
            .map(|m| m.as_str().to_string()),
    );
    Some(labels)
}

fn parse_apl_slide(img_name: &str) -> Option<BTreeSet<String>> {
    if REGISTER.is_match(img_name) || AIDA_2000.is_match(img_name) {
        return Some(set(["aml", "m3"]));
    }
    let caps = PAT_SLIDE.captures(img_name)?;
    let subtype = caps
        .get(4)
        .map(|m| m.as_str().to_lowercase())
        .filter(|subtype| subtype != "notclassified")
        .unwrap_or_else(|| "not_classified".to_string());
    Some(set(["aml", subtype.as_str()]))
}

// `None` means the token carries no label.
pub fn fix_legacy_label(label: &str) -> Option<String> {
    if JUNK_LABELS.contains(&label) {
        return None;
    }
    let fixed = if label.contains("m4") {
        "m4".to_string()
    } else if label.contains("m5") {
        "m5".to_string()
    } else if label == "notclassified" {
        "not_classified".to_string()
    } else {
        label.to_lowercase()
    };
    Some(fixed)
}

pub fn normalize_wsi_labels(wsi: &WsiRecord) -> Result<BTreeSet<String>, AnnotError> {
    let raw = parse_wsi_labels(wsi.dataset_id, &wsi.img_name)?;
    Ok(raw.iter().filter_map(|label| fix_legacy_label(label)).collect())
}

fn set<const N: usize>(labels: [&str; N]) -> BTreeSet<String> {
    labels.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn wsi(dataset_id: i64, img_name: &str) -> WsiRecord {
        WsiRecord {
            id: 1,
            img_name: img_name.to_string(),
            dataset_id,
            pixel_diameter_in_micrometer: None,
            resource_url: None,
        }
    }

    #[test]
    fn healthy_dataset_ignores_filename() {
        for name in ["x.png", "pat1-slide2-m4", ""] {
            assert_eq!(
                normalize_wsi_labels(&wsi(DATASET_HEALTHY, name)).unwrap(),
                set(["healthy"])
            );
        }
    }

    #[test]
    fn aml_slide_subtype_and_suffix() {
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_AML, "pat1-slide2-m4")).unwrap(),
            set(["aml", "m4"])
        );
        assert_eq!(
            parse_wsi_labels(DATASET_AML, "pat12-slider3.m5-npm").unwrap(),
            set(["aml", "m5", "npm"])
        );
        assert_eq!(
            parse_wsi_labels(DATASET_AML, "pat7-slide 1").unwrap(),
            set(["aml"])
        );
    }

    #[test]
    fn aml_slide_junk_subtype_is_dropped() {
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_AML, "pat3-slide4.50x.png")).unwrap(),
            set(["aml"])
        );
    }

    #[test]
    fn aml_slide_requires_prefix() {
        assert_matches!(
            parse_wsi_labels(DATASET_AML, "slide-pat1-slide2"),
            Err(AnnotError::InvalidWsiName { dataset_id: 2, .. })
        );
    }

    #[test]
    fn apl_register_and_aida_are_m3() {
        assert_eq!(
            parse_wsi_labels(DATASET_APL, "0042-Napoleon-Register-3-40x.png").unwrap(),
            set(["aml", "m3"])
        );
        assert_eq!(
            parse_wsi_labels(DATASET_APL, "x17-aida2000-5.png").unwrap(),
            set(["aml", "m3"])
        );
    }

    #[test]
    fn apl_pat_slide_subtypes() {
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_APL, "Pat12-Slide 3-M4-40x.png")).unwrap(),
            set(["aml", "m4"])
        );
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_APL, "Pat12_3.40x.png")).unwrap(),
            set(["aml", "not_classified"])
        );
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_APL, "Pat12-3-notclassified-40x.png")).unwrap(),
            set(["aml", "not_classified"])
        );
        assert_eq!(
            normalize_wsi_labels(&wsi(DATASET_APL, "Pat12-3-Not_Classified-40x.png")).unwrap(),
            set(["aml", "not_classified"])
        );
    }

    #[test]
    fn unparseable_names_are_fatal() {
        let err = normalize_wsi_labels(&wsi(DATASET_APL, "unparseable.png")).unwrap_err();
        assert_matches!(err, AnnotError::InvalidWsiName { dataset_id: 1, .. });
        assert!(err.to_string().contains("unparseable.png"));

        assert_matches!(
            normalize_wsi_labels(&wsi(9, "pat1-slide2-m4")),
            Err(AnnotError::InvalidWsiName { dataset_id: 9, .. })
        );
    }

    #[test]
    fn legacy_fixer() {
        for junk in JUNK_LABELS {
            assert_eq!(fix_legacy_label(junk), None);
        }
        assert_eq!(fix_legacy_label("m4eo").as_deref(), Some("m4"));
        assert_eq!(fix_legacy_label("xm5b").as_deref(), Some("m5"));
        assert_eq!(fix_legacy_label("notclassified").as_deref(), Some("not_classified"));
        assert_eq!(fix_legacy_label("M3").as_deref(), Some("m3"));
        assert_eq!(fix_legacy_label("AML").as_deref(), Some("aml"));
    }
}
