use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AnnotError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsiRecord {
    pub id: i64,
    #[serde(rename = "imgName")]
    pub img_name: String,
    #[serde(rename = "datasetId")]
    pub dataset_id: i64,
    #[serde(rename = "pixelDiameterInMicrometer", default)]
    pub pixel_diameter_in_micrometer: Option<f64>,
    #[serde(rename = "ressourceUrl", default)]
    pub resource_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledWsi {
    pub record: WsiRecord,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub id: i64,
    #[serde(rename = "wsi", deserialize_with = "de_id")]
    pub wsi_id: i64,
    #[serde(rename = "imgName")]
    pub img_name: String,
    #[serde(rename = "ressourceUrl", default)]
    pub resource_url: Option<String>,
    // kept raw so a malformed box only fails the crop of this one cell
    #[serde(default)]
    pub bbox: Option<Value>,
}

impl CellRecord {
    pub fn bounding_box(&self) -> Result<BoundingBox, AnnotError> {
        let invalid = |message: String| AnnotError::InvalidBoundingBox {
            cell_id: self.id,
            message,
        };
        let raw = match &self.bbox {
            None | Some(Value::Null) => return Err(invalid("no bounding box".to_string())),
            Some(raw) => raw,
        };
        let coords: Vec<i64> =
            serde_json::from_value(raw.clone()).map_err(|err| invalid(err.to_string()))?;
        BoundingBox::from_slice(&coords).map_err(|message| AnnotError::InvalidBoundingBox {
            cell_id: self.id,
            message,
        })
    }
}

// [row_min, col_min, row_max, col_max], max exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub row_min: u32,
    pub col_min: u32,
    pub row_max: u32,
    pub col_max: u32,
}

impl BoundingBox {
    fn from_slice(raw: &[i64]) -> Result<Self, String> {
        let [row_min, col_min, row_max, col_max] = raw else {
            return Err(format!("expected 4 coordinates, got {}", raw.len()));
        };
        let coord = |value: i64| {
            u32::try_from(value).map_err(|_| format!("coordinate out of range: {value}"))
        };
        let bbox = Self {
            row_min: coord(*row_min)?,
            col_min: coord(*col_min)?,
            row_max: coord(*row_max)?,
            col_max: coord(*col_max)?,
        };
        if bbox.row_max <= bbox.row_min || bbox.col_max <= bbox.col_min {
            return Err(format!("empty region {raw:?}"));
        }
        Ok(bbox)
    }

    pub fn width(&self) -> u32 {
        self.col_max - self.col_min
    }

    pub fn height(&self) -> u32 {
        self.row_max - self.row_min
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.row_min, self.col_min, self.row_max, self.col_max
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: i64,
    #[serde(rename = "cell", deserialize_with = "de_id")]
    pub cell_id: i64,
    #[serde(rename = "annotator", deserialize_with = "de_id")]
    pub annotator_id: i64,
    #[serde(rename = "labelGroup")]
    pub label_group: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInSelection {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "annotatorCellLabelSelection", deserialize_with = "de_id")]
    pub selection_id: i64,
    #[serde(rename = "label", deserialize_with = "de_id")]
    pub label_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub id: i64,
    #[serde(rename = "labelGroup")]
    pub label_group: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

pub trait ImageSource {
    fn img_name(&self) -> &str;
    fn resource_url(&self) -> Option<&str>;
}

impl ImageSource for WsiRecord {
    fn img_name(&self) -> &str {
        &self.img_name
    }

    fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }
}

impl ImageSource for LabeledWsi {
    fn img_name(&self) -> &str {
        &self.record.img_name
    }

    fn resource_url(&self) -> Option<&str> {
        self.record.resource_url.as_deref()
    }
}

impl ImageSource for CellRecord {
    fn img_name(&self) -> &str {
        &self.img_name
    }

    fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

fn de_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawId::deserialize(deserializer)? {
        RawId::Number(value) => Ok(value),
        RawId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid id: {text}"))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_selection_with_string_ids() {
        let selection: Selection = serde_json::from_value(json!({
            "id": 7,
            "cell": "12",
            "annotator": "15",
            "labelGroup": 1
        }))
        .unwrap();
        assert_eq!(selection.cell_id, 12);
        assert_eq!(selection.annotator_id, 15);
    }

    #[test]
    fn parse_wsi_requires_img_name() {
        let err = serde_json::from_value::<WsiRecord>(json!({"id": 1, "datasetId": 3}))
            .unwrap_err();
        assert!(err.to_string().contains("imgName"));
    }

    #[test]
    fn label_definition_keeps_metadata() {
        let label: LabelDefinition = serde_json::from_value(json!({
            "id": 1,
            "labelGroup": 2,
            "name": "Promyelocyte",
            "color": "#ff0000"
        }))
        .unwrap();
        assert_eq!(label.name.as_deref(), Some("Promyelocyte"));
        assert_eq!(label.metadata.get("color"), Some(&json!("#ff0000")));
    }

    #[test]
    fn bounding_box_validation() {
        let mut cell = CellRecord {
            id: 4,
            wsi_id: 1,
            img_name: "4.png".to_string(),
            resource_url: None,
            bbox: Some(json!([10, 20, 30, 50])),
        };
        let bbox = cell.bounding_box().unwrap();
        assert_eq!((bbox.width(), bbox.height()), (30, 20));

        cell.bbox = Some(json!([10, 20, 5]));
        assert_matches!(
            cell.bounding_box(),
            Err(AnnotError::InvalidBoundingBox { cell_id: 4, .. })
        );

        cell.bbox = Some(json!([10, 20, 10, 50]));
        assert_matches!(cell.bounding_box(), Err(AnnotError::InvalidBoundingBox { .. }));

        cell.bbox = Some(json!("10,20,30,50"));
        assert_matches!(cell.bounding_box(), Err(AnnotError::InvalidBoundingBox { .. }));

        cell.bbox = Some(Value::Null);
        assert_matches!(cell.bounding_box(), Err(AnnotError::InvalidBoundingBox { .. }));

        cell.bbox = None;
        assert_matches!(cell.bounding_box(), Err(AnnotError::InvalidBoundingBox { .. }));
    }
}
