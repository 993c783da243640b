use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Where a scanned class came from.
///
/// - `Seed`: application code whose annotations drive default queries.
/// - `Partial`: metadata-complete library code.
/// - `Excluded`: library code left out by ordering rules, plus classes that
///   failed to decode.
/// - `External`: referenced by scanned classes but not owned by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    Seed,
    Partial,
    Excluded,
    External,
}

impl ScanPolicy {
    pub const ALL: [ScanPolicy; 4] = [
        ScanPolicy::Seed,
        ScanPolicy::Partial,
        ScanPolicy::Excluded,
        ScanPolicy::External,
    ];

    pub fn bit(self) -> u8 {
        match self {
            ScanPolicy::Seed => 0x01,
            ScanPolicy::Partial => 0x02,
            ScanPolicy::Excluded => 0x04,
            ScanPolicy::External => 0x08,
        }
    }

    pub fn index(self) -> usize {
        match self {
            ScanPolicy::Seed => 0,
            ScanPolicy::Partial => 1,
            ScanPolicy::Excluded => 2,
            ScanPolicy::External => 3,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ScanPolicy::Seed => "seed",
            ScanPolicy::Partial => "partial",
            ScanPolicy::Excluded => "excluded",
            ScanPolicy::External => "external",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.tag() == tag)
    }

    pub fn accept(self, policies: ScanPolicies) -> bool {
        policies.0 & self.bit() != 0
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Bit mask of scan policies used to select query regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanPolicies(pub u8);

impl ScanPolicies {
    pub const NONE: ScanPolicies = ScanPolicies(0);
    pub const SEED: ScanPolicies = ScanPolicies(0x01);
    pub const PARTIAL: ScanPolicies = ScanPolicies(0x02);
    pub const EXCLUDED: ScanPolicies = ScanPolicies(0x04);
    pub const EXTERNAL: ScanPolicies = ScanPolicies(0x08);
    pub const INTERNAL: ScanPolicies = ScanPolicies(0x07);
    pub const ALL: ScanPolicies = ScanPolicies(0x0f);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn policies(self) -> impl Iterator<Item = ScanPolicy> {
        ScanPolicy::ALL.into_iter().filter(move |p| p.accept(self))
    }
}

impl From<ScanPolicy> for ScanPolicies {
    fn from(policy: ScanPolicy) -> Self {
        ScanPolicies(policy.bit())
    }
}

impl BitOr for ScanPolicies {
    type Output = ScanPolicies;

    fn bitor(self, rhs: Self) -> Self::Output {
        ScanPolicies(self.0 | rhs.0)
    }
}

impl BitOr<ScanPolicy> for ScanPolicies {
    type Output = ScanPolicies;

    fn bitor(self, rhs: ScanPolicy) -> Self::Output {
        ScanPolicies(self.0 | rhs.bit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationCategory {
    Package,
    Class,
    Field,
    Method,
}

impl AnnotationCategory {
    pub const ALL: [AnnotationCategory; 4] = [
        AnnotationCategory::Package,
        AnnotationCategory::Class,
        AnnotationCategory::Field,
        AnnotationCategory::Method,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            AnnotationCategory::Package => "package",
            AnnotationCategory::Class => "class",
            AnnotationCategory::Field => "field",
            AnnotationCategory::Method => "method",
        }
    }
}

impl fmt::Display for AnnotationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
