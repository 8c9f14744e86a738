//! Transfer units, batches and failure records.
//!
//! A [`TransferBatch`] is produced once per run by the image collector and
//! consumed by the batch engine. Every image movement is one
//! [`TransferUnit`]; every unit that does not make it is one
//! [`TransferFailure`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reference::{split_transport, ImageReference};

/// Kind of image being mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageType {
    Release,
    ReleaseContent,
    UpdateGraph,
    OperatorBundle,
    OperatorCatalog,
    OperatorRelatedImage,
    Generic,
    Helm,
}

impl ImageType {
    /// Release payload images; a failure on any of these is fatal.
    pub fn is_release(&self) -> bool {
        matches!(self, ImageType::Release | ImageType::ReleaseContent)
    }

    /// Reporting category of this image type.
    pub fn category(&self) -> Category {
        match self {
            ImageType::Release | ImageType::ReleaseContent | ImageType::UpdateGraph => {
                Category::Release
            }
            ImageType::OperatorBundle
            | ImageType::OperatorCatalog
            | ImageType::OperatorRelatedImage => Category::Operator,
            ImageType::Generic => Category::Additional,
            ImageType::Helm => Category::Helm,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageType::Release => "release",
            ImageType::ReleaseContent => "release-content",
            ImageType::UpdateGraph => "update-graph",
            ImageType::OperatorBundle => "operator-bundle",
            ImageType::OperatorCatalog => "operator-catalog",
            ImageType::OperatorRelatedImage => "operator-related-image",
            ImageType::Generic => "generic",
            ImageType::Helm => "helm",
        };
        write!(f, "{}", name)
    }
}

/// Reporting category used for success/total counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Release,
    Operator,
    Additional,
    Helm,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Release,
        Category::Operator,
        Category::Additional,
        Category::Helm,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Release => write!(f, "release"),
            Category::Operator => write!(f, "operator"),
            Category::Additional => write!(f, "additional"),
            Category::Helm => write!(f, "helm"),
        }
    }
}

/// Per-category image counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub release: usize,
    pub operator: usize,
    pub additional: usize,
    pub helm: usize,
}

impl CategoryCounts {
    /// Count units per category.
    pub fn from_units<'a>(units: impl IntoIterator<Item = &'a TransferUnit>) -> Self {
        let mut counts = Self::default();
        for unit in units {
            counts.increment(unit.image_type.category());
        }
        counts
    }

    pub fn increment(&mut self, category: Category) {
        *self.slot(category) += 1;
    }

    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::Release => self.release,
            Category::Operator => self.operator,
            Category::Additional => self.additional,
            Category::Helm => self.helm,
        }
    }

    pub fn total(&self) -> usize {
        self.release + self.operator + self.additional + self.helm
    }

    fn slot(&mut self, category: Category) -> &mut usize {
        match category {
            Category::Release => &mut self.release,
            Category::Operator => &mut self.operator,
            Category::Additional => &mut self.additional,
            Category::Helm => &mut self.helm,
        }
    }
}

/// Stable identity of an image origin.
///
/// Built once from an origin string: the transport prefix is stripped and
/// registry references are parsed, so `docker://nginx` and
/// `docker.io/library/nginx:latest` compare equal. Origins that do not parse
/// as registry references (local layouts, directories) keep their stripped
/// path as identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OriginKey {
    Image(ImageReference),
    Path(String),
}

impl OriginKey {
    pub fn from_origin(origin: &str) -> Self {
        match ImageReference::parse(origin) {
            Ok(reference) => OriginKey::Image(reference),
            Err(_) => OriginKey::Path(split_transport(origin).1.to_string()),
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginKey::Image(reference) => write!(f, "{}", reference),
            OriginKey::Path(path) => write!(f, "{}", path),
        }
    }
}

/// One image to move.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferUnit {
    /// Transport-qualified source reference
    pub source: String,
    /// Transport-qualified destination reference
    pub destination: String,
    /// Pre-mirroring logical identity
    pub origin: String,
    /// Image kind
    #[serde(rename = "type")]
    pub image_type: ImageType,
}

impl TransferUnit {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        origin: impl Into<String>,
        image_type: ImageType,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            origin: origin.into(),
            image_type,
        }
    }

    pub fn origin_key(&self) -> OriginKey {
        OriginKey::from_origin(&self.origin)
    }
}

/// Operators and bundles that reference a related image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReferrers {
    /// Operator (package) names
    #[serde(default)]
    pub operators: BTreeSet<String>,
    /// Bundle image origins
    #[serde(default)]
    pub bundles: BTreeSet<String>,
}

/// Index from a related image origin to the operators/bundles using it.
#[derive(Debug, Clone, Default)]
pub struct RelatedImageIndex {
    entries: BTreeMap<OriginKey, ImageReferrers>,
}

impl RelatedImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `origin` is referenced by `bundle`, which belongs to `operator`.
    pub fn insert(&mut self, origin: &str, operator: impl Into<String>, bundle: impl Into<String>) {
        let referrers = self.entries.entry(OriginKey::from_origin(origin)).or_default();
        referrers.operators.insert(operator.into());
        referrers.bundles.insert(bundle.into());
    }

    pub fn referrers(&self, origin: &str) -> Option<&ImageReferrers> {
        self.entries.get(&OriginKey::from_origin(origin))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialized form of the related image index: origin string → referrers.
impl Serialize for RelatedImageIndex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<String, &ImageReferrers> = self
            .entries
            .iter()
            .map(|(key, referrers)| (key.to_string(), referrers))
            .collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelatedImageIndex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, ImageReferrers>::deserialize(deserializer)?;
        let mut entries: BTreeMap<OriginKey, ImageReferrers> = BTreeMap::new();
        for (origin, referrers) in map {
            let slot = entries.entry(OriginKey::from_origin(&origin)).or_default();
            slot.operators.extend(referrers.operators);
            slot.bundles.extend(referrers.bundles);
        }
        Ok(Self { entries })
    }
}

/// All images of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferBatch {
    pub units: Vec<TransferUnit>,
    /// Per-category totals; recomputed from `units` when absent
    #[serde(default)]
    pub totals: CategoryCounts,
    /// Related image origin → referencing operators/bundles
    #[serde(default)]
    pub related: RelatedImageIndex,
}

impl TransferBatch {
    pub fn new(units: Vec<TransferUnit>) -> Self {
        let totals = CategoryCounts::from_units(&units);
        Self {
            units,
            totals,
            related: RelatedImageIndex::new(),
        }
    }

    pub fn with_related(mut self, related: RelatedImageIndex) -> Self {
        self.related = related;
        self
    }

    /// Recompute totals if the collector did not provide them.
    pub fn normalize(&mut self) {
        if self.totals.total() == 0 && !self.units.is_empty() {
            self.totals = CategoryCounts::from_units(&self.units);
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// How a failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// Collected and reported; the run continues.
    Recoverable,
    /// The run stops; no archive or downstream artifact may be produced.
    Fatal,
}

impl FailureSeverity {
    pub fn of(unit: &TransferUnit) -> Self {
        if unit.image_type.is_release() {
            FailureSeverity::Fatal
        } else {
            FailureSeverity::Recoverable
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub unit: TransferUnit,
    pub cause: String,
    /// Operators referencing the failed image, if known
    pub operators: BTreeSet<String>,
    /// Bundles referencing the failed image, if known
    pub bundles: BTreeSet<String>,
}

impl TransferFailure {
    pub fn new(unit: TransferUnit, cause: impl Into<String>) -> Self {
        Self {
            unit,
            cause: cause.into(),
            operators: BTreeSet::new(),
            bundles: BTreeSet::new(),
        }
    }

    pub fn with_referrers(mut self, referrers: Option<&ImageReferrers>) -> Self {
        if let Some(referrers) = referrers {
            self.operators = referrers.operators.clone();
            self.bundles = referrers.bundles.clone();
        }
        self
    }

    pub fn severity(&self) -> FailureSeverity {
        FailureSeverity::of(&self.unit)
    }

    /// Whether this failure was caused by (or references) the given bundle.
    pub fn references_bundle(&self, bundle: &OriginKey) -> bool {
        self.bundles
            .iter()
            .any(|b| &OriginKey::from_origin(b) == bundle)
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error mirroring image {}", self.unit.origin)?;
        if !self.bundles.is_empty() || !self.operators.is_empty() {
            write!(
                f,
                " (Operator bundles: [{}] - Operators: [{}])",
                join(&self.bundles),
                join(&self.operators)
            )?;
        }
        write!(f, " error: {}", self.cause)
    }
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(origin: &str, image_type: ImageType) -> TransferUnit {
        TransferUnit::new(
            format!("docker://{}", origin),
            format!("docker://mirror.local/{}", origin),
            origin,
            image_type,
        )
    }

    #[test]
    fn test_release_types_are_fatal() {
        assert!(ImageType::Release.is_release());
        assert!(ImageType::ReleaseContent.is_release());
        assert!(!ImageType::UpdateGraph.is_release());
        assert_eq!(
            FailureSeverity::of(&unit("quay.io/r:1", ImageType::ReleaseContent)),
            FailureSeverity::Fatal
        );
        assert_eq!(
            FailureSeverity::of(&unit("quay.io/b:1", ImageType::OperatorBundle)),
            FailureSeverity::Recoverable
        );
    }

    #[test]
    fn test_category_counts_from_units() {
        let units = vec![
            unit("quay.io/r:1", ImageType::Release),
            unit("quay.io/g:1", ImageType::UpdateGraph),
            unit("quay.io/b:1", ImageType::OperatorBundle),
            unit("quay.io/c:1", ImageType::OperatorCatalog),
            unit("quay.io/x:1", ImageType::Generic),
            unit("quay.io/h:1", ImageType::Helm),
        ];
        let counts = CategoryCounts::from_units(&units);
        assert_eq!(counts.release, 2);
        assert_eq!(counts.operator, 2);
        assert_eq!(counts.additional, 1);
        assert_eq!(counts.helm, 1);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn test_origin_key_normalizes_transport_and_defaults() {
        assert_eq!(
            OriginKey::from_origin("docker://nginx"),
            OriginKey::from_origin("docker.io/library/nginx:latest")
        );
        assert_ne!(
            OriginKey::from_origin("quay.io/org/app:v1"),
            OriginKey::from_origin("quay.io/org/app:v10")
        );
        assert_eq!(
            OriginKey::from_origin("oci:///srv/layout"),
            OriginKey::Path("/srv/layout".to_string())
        );
    }

    #[test]
    fn test_related_index_lookup_ignores_transport() {
        let mut index = RelatedImageIndex::new();
        index.insert("quay.io/org/operand:v1", "etcd", "quay.io/org/etcd-bundle:v1");
        let referrers = index.referrers("docker://quay.io/org/operand:v1").unwrap();
        assert!(referrers.operators.contains("etcd"));
        assert!(referrers.bundles.contains("quay.io/org/etcd-bundle:v1"));
        assert!(index.referrers("quay.io/org/other:v1").is_none());
    }

    #[test]
    fn test_failure_references_bundle() {
        let mut index = RelatedImageIndex::new();
        index.insert("quay.io/org/operand:v1", "etcd", "docker://quay.io/org/etcd-bundle:v1");
        let failure = TransferFailure::new(
            unit("quay.io/org/operand:v1", ImageType::OperatorRelatedImage),
            "boom",
        )
        .with_referrers(index.referrers("quay.io/org/operand:v1"));

        assert!(failure.references_bundle(&OriginKey::from_origin("quay.io/org/etcd-bundle:v1")));
        assert!(!failure.references_bundle(&OriginKey::from_origin("quay.io/org/etcd-bundle:v2")));
    }

    #[test]
    fn test_failure_display_with_referrers() {
        let mut index = RelatedImageIndex::new();
        index.insert("quay.io/org/operand:v1", "etcd", "quay.io/org/etcd-bundle:v1");
        let failure = TransferFailure::new(
            unit("quay.io/org/operand:v1", ImageType::OperatorRelatedImage),
            "manifest unknown",
        )
        .with_referrers(index.referrers("quay.io/org/operand:v1"));
        assert_eq!(
            failure.to_string(),
            "error mirroring image quay.io/org/operand:v1 (Operator bundles: [quay.io/org/etcd-bundle:v1] - Operators: [etcd]) error: manifest unknown"
        );
    }

    #[test]
    fn test_failure_display_without_referrers() {
        let failure = TransferFailure::new(unit("quay.io/x:1", ImageType::Generic), "denied");
        assert_eq!(failure.to_string(), "error mirroring image quay.io/x:1 error: denied");
    }

    #[test]
    fn test_batch_yaml_roundtrip_keeps_related_index() {
        let yaml = r#"
units:
  - source: docker://quay.io/org/operand:v1
    destination: docker://localhost:55000/org/operand:v1
    origin: quay.io/org/operand:v1
    type: operator-related-image
related:
  "docker://quay.io/org/operand:v1":
    operators: [etcd]
    bundles: [quay.io/org/etcd-bundle:v1]
"#;
        let mut batch: TransferBatch = serde_yaml::from_str(yaml).unwrap();
        batch.normalize();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.totals.operator, 1);
        assert_eq!(batch.units[0].image_type, ImageType::OperatorRelatedImage);
        assert!(batch.related.referrers("quay.io/org/operand:v1").is_some());
    }
}
