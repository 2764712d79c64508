use crate::discovery::DiscoverySettings;
use crate::tracker::{TrackerSettings, DEATH_PROBABILITY, MIN_MATCH_ERROR, POINT_TRIAL_PERIOD};

/// Producer tunables that are fixed for the lifetime of a run. Settings a
/// UI may change while running live in the store header instead.
#[derive(Debug, Clone)]
#[derive(clap::Parser)]
pub struct Config {
    /// Seed for culling and discovery jitter
    #[clap(long, default_value = "0")]
    pub seed: u64,

    #[clap(long, default_value = "0.001")]
    pub death_probability: f32,

    /// Frames before a point's motion is trusted
    #[clap(long, default_value = "8")]
    pub trial_period: u32,

    #[clap(long, default_value = "5")]
    pub grid_spacing: usize,

    /// Fraction of the grid spacing
    #[clap(long, default_value = "0.4")]
    pub jitter: f32,

    /// Share of the frame period that may be spent before discovery is skipped
    #[clap(long, default_value = "0.5")]
    pub discovery_budget: f64,
}

impl Default for Config {
    fn default() -> Self {
        let discovery = DiscoverySettings::default();
        Config {
            seed: 0,
            death_probability: DEATH_PROBABILITY,
            trial_period: POINT_TRIAL_PERIOD,
            grid_spacing: discovery.grid_spacing,
            jitter: discovery.jitter,
            discovery_budget: 0.5,
        }
    }
}

impl Config {
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            death_probability: self.death_probability,
            trial_period: self.trial_period,
            min_error: MIN_MATCH_ERROR,
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            grid_spacing: self.grid_spacing,
            jitter: self.jitter,
        }
    }
}
