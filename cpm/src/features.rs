/*
 * Copyright 2024 Fluence Labs Limited
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::fmt;

use thiserror::Error as ThisError;

/// The functionalities the library can drive, each gated on its own
/// init time probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    FrequencyScaling,
    Epp,
    CStates,
    Uncore,
}

impl Feature {
    pub(crate) const ALL: [Feature; 4] = [
        Feature::FrequencyScaling,
        Feature::Epp,
        Feature::CStates,
        Feature::Uncore,
    ];

    pub const fn display_name(self) -> &'static str {
        match self {
            Feature::FrequencyScaling => "frequency-scaling",
            Feature::Epp => "energy-performance-preference",
            Feature::CStates => "c-states",
            Feature::Uncore => "uncore-frequency",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum FeatureError {
    /// The distinguished pre-init state of every feature.
    #[error("feature uninitialised")]
    Uninitialised,

    /// Queried feature is not present in the registry at all.
    #[error("feature undefined")]
    Undefined,

    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("{0}")]
    Probe(String),
}

impl FeatureError {
    pub(crate) fn probe(message: impl Into<String>) -> Self {
        Self::Probe(message.into())
    }
}

/// Outcome of one feature probe: the observed driver and, when the probe
/// failed, the reason the feature is unavailable. Frozen after host init.
#[derive(Clone, Debug)]
pub struct FeatureStatus {
    feature: Feature,
    pub(crate) driver: String,
    pub(crate) error: Option<FeatureError>,
}

impl FeatureStatus {
    pub(crate) fn new(feature: Feature) -> Self {
        Self {
            feature,
            driver: "N/A".to_string(),
            error: None,
        }
    }

    pub(crate) fn uninitialised(feature: Feature) -> Self {
        Self {
            feature,
            driver: "N/A".to_string(),
            error: Some(FeatureError::Uninitialised),
        }
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }

    pub fn name(&self) -> &'static str {
        self.feature.display_name()
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn error(&self) -> Option<&FeatureError> {
        self.error.as_ref()
    }

    pub fn is_supported(&self) -> bool {
        self.error.is_none()
    }
}

/// Stores what the library is allowed to do on the current machine.
#[derive(Clone, Debug, Default)]
pub struct FeatureSet {
    statuses: HashMap<Feature, FeatureStatus>,
}

impl FeatureSet {
    /// Every defined feature in its pre-probe sentinel state.
    pub(crate) fn uninitialised() -> Self {
        let statuses = Feature::ALL
            .iter()
            .map(|feature| (*feature, FeatureStatus::uninitialised(*feature)))
            .collect();
        Self { statuses }
    }

    pub(crate) fn set(&mut self, feature: Feature, status: FeatureStatus) {
        self.statuses.insert(feature, status);
    }

    pub fn get(&self, feature: Feature) -> Option<&FeatureStatus> {
        self.statuses.get(&feature)
    }

    pub fn is_supported(&self, feature: Feature) -> bool {
        self.statuses
            .get(&feature)
            .map(FeatureStatus::is_supported)
            .unwrap_or(false)
    }

    pub fn all_supported(&self, features: &[Feature]) -> bool {
        features.iter().all(|feature| self.is_supported(*feature))
    }

    pub fn any_supported(&self) -> bool {
        self.statuses.values().any(FeatureStatus::is_supported)
    }

    /// The error a feature failed with; `None` means the feature works.
    /// An id missing from the registry reports `FeatureError::Undefined`.
    pub fn error(&self, feature: Feature) -> Option<FeatureError> {
        match self.statuses.get(&feature) {
            None => Some(FeatureError::Undefined),
            Some(status) => status.error.clone(),
        }
    }

    /// All failed features with their errors, in a stable order.
    pub fn errors(&self) -> Vec<(Feature, FeatureError)> {
        let mut errors: Vec<_> = self
            .statuses
            .iter()
            .filter_map(|(feature, status)| {
                status.error.clone().map(|error| (*feature, error))
            })
            .collect();
        errors.sort_by_key(|(feature, _)| *feature);
        errors
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, &FeatureStatus)> {
        self.statuses.iter().map(|(feature, status)| (*feature, status))
    }
}
