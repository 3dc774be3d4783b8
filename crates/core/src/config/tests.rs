use super::*;
use crate::dataset::ObjectTarget;
use crate::schedule::Recurrence;

const SAMPLE: &str = r#"
[[datasets]]
id = "HOUSEHOLD_INCOME"
url = "https://api.census.gov/data/timeseries/poverty/saipe"
gcs_bucket = "landing"
filename = "SAIPE"
every = "24h"

[[datasets]]
id = "POPULATION"
url = "https://api.census.gov/data/2019/pep/population"
gcs_bucket = "landing"
filename = "POPULATION"
cron = "0 6 * * *"
run_on_start = true

[[joins]]
name = "income_with_population"
depends_on = ["HOUSEHOLD_INCOME", "POPULATION"]
on = ["state", "county"]
stale_after = "36h"
"#;

#[test]
fn parses_datasets_and_joins() {
    let config = PipelineConfig::from_toml(SAMPLE).unwrap();
    assert_eq!(config.datasets.len(), 2);
    assert_eq!(config.joins.len(), 1);

    let income = config.dataset("HOUSEHOLD_INCOME").unwrap();
    let d = income.descriptor().unwrap();
    assert_eq!(d.target, ObjectTarget::Exact("SAIPE".into()));
    assert!(matches!(income.recurrence().unwrap(), Some(Recurrence::Every(_))));

    let pop = config.dataset("POPULATION").unwrap();
    assert!(pop.run_on_start);
    assert!(matches!(pop.recurrence().unwrap(), Some(Recurrence::Cron(_))));

    let join = &config.joins[0];
    assert_eq!(join.max_attempts, 3);
    assert_eq!(join.stale_after().unwrap().as_secs(), 36 * 3_600);
}

#[test]
fn empty_config_is_valid() {
    let config = PipelineConfig::from_toml("").unwrap();
    assert!(config.datasets.is_empty());
    assert!(config.joins.is_empty());
}

#[test]
fn dataset_without_recurrence_is_manual_only() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
fileprefix = "a-"
"#;
    let config = PipelineConfig::from_toml(toml).unwrap();
    assert!(config.datasets[0].recurrence().unwrap().is_none());
}

#[test]
fn rejects_duplicate_dataset_ids() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"

[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "b"
"#;
    let err = PipelineConfig::from_toml(toml).unwrap_err();
    assert!(err.to_string().contains("duplicate dataset id"));
}

#[test]
fn rejects_filename_and_prefix_together() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"
fileprefix = "a-"
"#;
    assert!(PipelineConfig::from_toml(toml).is_err());
}

#[test]
fn rejects_every_and_cron_together() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"
every = "1h"
cron = "0 * * * *"
"#;
    let err = PipelineConfig::from_toml(toml).unwrap_err();
    assert!(err.to_string().contains("both every and cron"));
}

#[test]
fn rejects_join_on_unknown_dataset() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"

[[joins]]
name = "j"
depends_on = ["A", "B"]
on = ["k"]
"#;
    let err = PipelineConfig::from_toml(toml).unwrap_err();
    assert!(err.to_string().contains("unknown dataset 'B'"));
}

#[test]
fn rejects_join_with_single_dependency() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"

[[joins]]
name = "j"
depends_on = ["A"]
on = ["k"]
"#;
    let err = PipelineConfig::from_toml(toml).unwrap_err();
    assert!(err.to_string().contains("at least two"));
}

#[test]
fn rejects_join_named_like_a_dataset() {
    let toml = r#"
[[datasets]]
id = "A"
gcs_bucket = "landing"
filename = "a"

[[datasets]]
id = "B"
gcs_bucket = "landing"
filename = "b"

[[joins]]
name = "A"
depends_on = ["A", "B"]
on = ["k"]
"#;
    assert!(PipelineConfig::from_toml(toml).is_err());
}

#[test]
fn bus_defaults_match_push_contract() {
    let bus = BusSettings::from_env_profiled("DATAFEED_TEST_UNUSED_PROFILE");
    assert!(bus.max_delivery_attempts >= 1);
    assert!(bus.min_backoff <= bus.max_backoff);
}

#[test]
fn profile_label_defaults() {
    let settings = Settings::for_profile("");
    assert_eq!(settings.profile_label(), "default");
    assert_eq!(Settings::for_profile("prod").profile, "PROD");
}
