use super::*;
use std::fs;
use tempfile::tempdir;

fn base() -> Definitions {
    Definitions {
        name: "orders".into(),
        types: vec!["grpc".into()],
        version: "v1.2".into(),
        product: "shop".into(),
        ..Default::default()
    }
}

#[test]
fn test_load_toml() {
    let dir = tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("service.toml");
    fs::write(
        &path,
        r#"
name = "orders"
types = ["grpc", "http:9090"]
version = "v1.0.3"
product = "shop"
envs = ["DATABASE_URL"]

[log]
level = "debug"

[http]
hide_error_details = true

[clients.payments]
host = "localhost"
port = 7171

[features.tracker]
enabled = true
"#,
    )
    .unwrap();

    let defs = Definitions::load(&path).expect("Failed to load definitions");
    assert_eq!(defs.name, "orders");
    assert_eq!(defs.log.level.as_deref(), Some("debug"));
    assert!(defs.http.hide_error_details);
    assert_eq!(defs.clients["payments"].port, 7171);
    assert!(defs.is_feature_enabled("tracker"));
    assert!(!defs.is_feature_enabled("missing"));
    assert_eq!(
        defs.service_types(),
        vec![(ServiceType::GRPC, None), (ServiceType::HTTP, Some(9090))]
    );
    assert_eq!(defs.service_types_as_string(), "grpc,http");
    defs.validate_all().expect("definitions should be valid");
}

#[test]
fn test_load_yaml() {
    let dir = tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("service.yaml");
    fs::write(
        &path,
        r#"
name: worker
types: [native]
version: v2
product: shop
services:
  native:
    interval_ms: 500
"#,
    )
    .unwrap();

    let defs = Definitions::load(&path).expect("Failed to load definitions");
    assert!(defs.is_service_type(&ServiceType::NATIVE));
    assert_eq!(
        defs.service_settings(&ServiceType::NATIVE).unwrap()["interval_ms"],
        500
    );
}

#[test]
fn test_env_overrides_file() {
    figment::Jail::expect_with(|jail| {
        jail.create_file(
            "service.toml",
            r#"
name = "orders"
types = ["grpc"]
version = "v1"
product = "shop"
"#,
        )?;
        jail.set_env("SVCKIT_DEFS__PRODUCT", "market");

        let defs = Definitions::load("service.toml").expect("load");
        assert_eq!(defs.product, "market");
        Ok(())
    });
}

#[test]
fn test_version_format() {
    for ok in ["v1", "v1.0", "v10.20.30"] {
        let mut d = base();
        d.version = ok.into();
        assert!(d.validate_all().is_ok(), "{ok} should be valid");
    }
    for bad in ["1.0", "v1.0.0.0", "v100", "version"] {
        let mut d = base();
        d.version = bad.into();
        assert!(
            matches!(d.validate_all(), Err(DefinitionsError::Invalid(_))),
            "{bad} should be rejected"
        );
    }
}

#[test]
fn test_script_must_be_alone() {
    let mut d = base();
    d.types = vec!["script".into(), "grpc".into()];
    assert!(matches!(d.validate_all(), Err(DefinitionsError::ScriptNotAlone)));

    d.types = vec!["script".into()];
    assert!(d.validate_all().is_ok());
}

#[test]
fn test_duplicated_and_unknown_types() {
    let mut d = base();
    d.types = vec!["grpc".into(), "grpc:7000".into()];
    assert!(matches!(
        d.validate_all(),
        Err(DefinitionsError::DuplicatedType(t)) if t == "grpc"
    ));

    d.types = vec!["websocket".into()];
    assert!(matches!(
        d.validate_all(),
        Err(DefinitionsError::UnsupportedType(t)) if t == "websocket"
    ));

    d.add_supported_service_type(ServiceType::new("websocket"));
    assert!(d.validate_all().is_ok());

    d.types = vec!["http:notaport".into()];
    assert!(matches!(d.validate_all(), Err(DefinitionsError::InvalidPort(_))));
}

#[test]
fn test_env_names_must_be_upper_case() {
    let mut d = base();
    d.envs = vec!["database_url".into()];
    assert!(d.validate_all().is_err());
}

struct Limits {
    max: u32,
}

impl ExternalDefinitions for Limits {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max > 0, "max must be positive");
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn test_external_definitions_are_validated() {
    let mut d = base();
    d.add_external_feature_definitions("limits", Arc::new(Limits { max: 0 }));
    match d.validate_all() {
        Err(DefinitionsError::External { name, .. }) => assert_eq!(name, "limits"),
        other => panic!("unexpected result: {other:?}"),
    }

    d.add_external_feature_definitions("limits", Arc::new(Limits { max: 3 }));
    assert!(d.validate_all().is_ok());
    let stored = d.external_feature_definitions("limits").unwrap();
    assert_eq!(stored.as_any().downcast_ref::<Limits>().unwrap().max, 3);
}

#[test]
fn test_yaml_rendering() {
    let yaml = base().to_yaml().unwrap();
    assert!(yaml.contains("name: orders"));
    assert!(yaml.contains("- grpc"));
}
