use clap::{Parser, Subcommand, ValueEnum};
use fleet_index_lib::{
    Config, FormFactor, PropulsionType, SearchParameters, StationFilter, VehicleFilter,
};
use node_entrypoints::{get_env, parse_args};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Fleet Node - aggregates shared-mobility feed snapshots into a searchable geospatial index
///
/// Every timing flag can also be set through the environment variable named in its help;
/// flags win over the environment, which wins over the built-in default. Values are capped at
/// ten years.
pub struct Settings {
    #[clap(subcommand)]
    pub command: Command,

    /// Directory holding one provider snapshot (`*.json`) per file [env: FLEET_FEED_DIR]
    #[clap(long, value_name = "DIR", global = true)]
    pub feed_dir: Option<PathBuf>,

    /// Name of the leadership lock [env: FLEET_LOCK_NAME]
    #[clap(long, global = true)]
    pub lock_name: Option<String>,

    /// Interval between leadership heartbeats [env: FLEET_HEARTBEAT_INTERVAL_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Maximum wait for the leadership lock on each heartbeat [env: FLEET_LOCK_WAIT_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub lock_wait_ms: Option<u64>,

    /// Lease granted on each lock acquisition [env: FLEET_LOCK_LEASE_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub lock_lease_ms: Option<u64>,

    /// Interval between feed directory polls while leader [env: FLEET_FEED_UPDATE_INTERVAL_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub feed_update_interval_ms: Option<u64>,

    /// Interval between orphan sweeps while leader [env: FLEET_ORPHAN_SWEEP_INTERVAL_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub orphan_sweep_interval_ms: Option<u64>,

    /// Lower bound for vehicle TTLs [env: FLEET_VEHICLE_TTL_MIN_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub vehicle_ttl_min_ms: Option<u64>,

    /// Upper bound for vehicle TTLs [env: FLEET_VEHICLE_TTL_MAX_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub vehicle_ttl_max_ms: Option<u64>,

    /// Lower bound for station TTLs [env: FLEET_STATION_TTL_MIN_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub station_ttl_min_ms: Option<u64>,

    /// TTL for systems, vehicle types, pricing plans and other reference data [env: FLEET_REFERENCE_TTL_MS]
    #[clap(long, value_name = "MS", global = true)]
    pub reference_ttl_ms: Option<u64>,

    /// Evict expired entries without change events, leaving them to the orphan sweep
    #[clap(long, default_value = "false", global = true)]
    pub silent_expiry: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a node: compete for leadership, poll the feed directory while leader
    Serve,
    /// Load the feed directory once and answer a single query as JSON on stdout
    Search(SearchArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Vehicles,
    Stations,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SearchArgs {
    /// What to search for
    #[clap(value_enum)]
    pub kind: SearchKind,

    /// Latitude of a range search center
    #[clap(long, allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Longitude of a range search center
    #[clap(long, allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// Radius of a range search, in meters
    #[clap(long, allow_negative_numbers = true)]
    pub range: Option<f64>,

    #[clap(long, allow_negative_numbers = true)]
    pub min_lat: Option<f64>,

    #[clap(long, allow_negative_numbers = true)]
    pub min_lon: Option<f64>,

    #[clap(long, allow_negative_numbers = true)]
    pub max_lat: Option<f64>,

    #[clap(long, allow_negative_numbers = true)]
    pub max_lon: Option<f64>,

    /// Maximum number of results
    #[clap(long, allow_negative_numbers = true)]
    pub count: Option<i64>,

    /// Only these codespaces (repeatable)
    #[clap(long = "codespace", value_name = "CODESPACE")]
    pub codespaces: Vec<String>,

    /// Only these systems (repeatable)
    #[clap(long = "system", value_name = "SYSTEM_ID")]
    pub systems: Vec<String>,

    /// Only these operators (repeatable)
    #[clap(long = "operator", value_name = "OPERATOR_ID")]
    pub operators: Vec<String>,

    /// Only these form factors, e.g. SCOOTER (repeatable)
    #[clap(long = "form-factor", value_name = "FORM_FACTOR")]
    pub form_factors: Vec<FormFactor>,

    /// Only these propulsion types, e.g. ELECTRIC (repeatable)
    #[clap(long = "propulsion-type", value_name = "PROPULSION_TYPE")]
    pub propulsion_types: Vec<PropulsionType>,

    /// Include reserved vehicles
    #[clap(long, default_value = "false")]
    pub include_reserved: bool,

    /// Include disabled vehicles
    #[clap(long, default_value = "false")]
    pub include_disabled: bool,
}

impl SearchArgs {
    pub fn parameters(&self) -> SearchParameters {
        SearchParameters {
            lat: self.lat,
            lon: self.lon,
            range: self.range,
            min_lat: self.min_lat,
            min_lon: self.min_lon,
            max_lat: self.max_lat,
            max_lon: self.max_lon,
            count: self.count,
        }
    }

    pub fn vehicle_filter(&self) -> VehicleFilter {
        VehicleFilter {
            codespaces: self.codespaces.clone(),
            systems: self.systems.clone(),
            operators: self.operators.clone(),
            form_factors: self.form_factors.clone(),
            propulsion_types: self.propulsion_types.clone(),
            include_reserved: self.include_reserved,
            include_disabled: self.include_disabled,
        }
    }

    pub fn station_filter(&self) -> StationFilter {
        StationFilter {
            codespaces: self.codespaces.clone(),
            systems: self.systems.clone(),
            operators: self.operators.clone(),
            available_form_factors: self.form_factors.clone(),
            available_propulsion_types: self.propulsion_types.clone(),
        }
    }
}

/// Upper bound for every `--*-ms` value: ten years
const MAX_MILLIS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// Flag, then environment variable, then default; capped at [`MAX_MILLIS`]
fn millis(flag: Option<u64>, env_key: &str, default: Duration) -> Duration {
    flag.or_else(|| get_env(env_key))
        .map(|ms| Duration::from_millis(ms.min(MAX_MILLIS)))
        .unwrap_or(default)
}

impl Settings {
    /// Parse the command line, exiting with usage on error
    pub fn from_cli() -> Self {
        match parse_args::<Settings>() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    pub fn feed_dir(&self) -> PathBuf {
        self.feed_dir
            .clone()
            .or_else(|| get_env("FLEET_FEED_DIR"))
            .unwrap_or_else(|| PathBuf::from("feeds"))
    }

    /// Resolve the library configuration
    pub fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            vehicle_ttl_min: millis(
                self.vehicle_ttl_min_ms,
                "FLEET_VEHICLE_TTL_MIN_MS",
                defaults.vehicle_ttl_min,
            ),
            vehicle_ttl_max: millis(
                self.vehicle_ttl_max_ms,
                "FLEET_VEHICLE_TTL_MAX_MS",
                defaults.vehicle_ttl_max,
            ),
            station_ttl_min: millis(
                self.station_ttl_min_ms,
                "FLEET_STATION_TTL_MIN_MS",
                defaults.station_ttl_min,
            ),
            reference_ttl: millis(
                self.reference_ttl_ms,
                "FLEET_REFERENCE_TTL_MS",
                defaults.reference_ttl,
            ),
            lock_name: self
                .lock_name
                .clone()
                .or_else(|| get_env("FLEET_LOCK_NAME"))
                .unwrap_or(defaults.lock_name),
            heartbeat_interval: millis(
                self.heartbeat_interval_ms,
                "FLEET_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            lock_wait: millis(self.lock_wait_ms, "FLEET_LOCK_WAIT_MS", defaults.lock_wait),
            lock_lease: millis(self.lock_lease_ms, "FLEET_LOCK_LEASE_MS", defaults.lock_lease),
            feed_update_interval: millis(
                self.feed_update_interval_ms,
                "FLEET_FEED_UPDATE_INTERVAL_MS",
                defaults.feed_update_interval,
            ),
            orphan_sweep_interval: millis(
                self.orphan_sweep_interval_ms,
                "FLEET_ORPHAN_SWEEP_INTERVAL_MS",
                defaults.orphan_sweep_interval,
            ),
            emit_expiry_events: !self.silent_expiry,
        }
    }
}
