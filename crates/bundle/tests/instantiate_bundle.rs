use std::fs;
use std::path::Path;

use flate2::{write::GzEncoder, Compression};
use keel_bundle::{instantiate, load_bundle};
use keel_core::{BundleRegistry, UpgraderConfig};

const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: sensor
  namespace: stackrox
  labels:
    auto-upgrade.stackrox.io/component: sensor
spec:
  selector:
    matchLabels:
      app: sensor
  template:
    metadata:
      labels:
        app: sensor
    spec:
      containers:
        - name: sensor
          image: stackrox/main:4.1.0
"#;

const RBAC: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: sensor
  namespace: stackrox
  labels:
    auto-upgrade.stackrox.io/component: sensor
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: stackrox:view-cluster
  labels:
    auto-upgrade.stackrox.io/component: sensor
rules: []
"#;

fn write_bundle(dir: &Path) {
    for (name, body) in [
        ("ca.pem", "CA"),
        ("sensor-cert.pem", "SC"),
        ("sensor-key.pem", "SK"),
        ("collector-cert.pem", "CC"),
        ("collector-key.pem", "CK"),
        ("sensor.yaml", DEPLOYMENT),
        ("sensor-rbac.yaml", RBAC),
        ("NOTES.txt", "read me"),
        ("sensor.sh", "#!/bin/sh"),
    ] {
        fs::write(dir.join(name), body).unwrap();
    }
    fs::create_dir(dir.join("additional-cas")).unwrap();
    fs::write(dir.join("additional-cas").join("corp.crt"), "pem").unwrap();
}

#[test]
fn directory_bundle_instantiates_in_a_stable_order() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path());
    let contents = load_bundle(dir.path()).unwrap();
    let objs = instantiate(contents.as_ref(), &BundleRegistry::default(), &UpgraderConfig::new("p1", "stackrox")).unwrap();
    let refs: Vec<String> = objs.iter().map(|o| o.object_ref().unwrap().to_string()).collect();
    assert_eq!(
        refs,
        vec![
            "v1/Secret stackrox/sensor-tls",
            "v1/Secret stackrox/collector-tls",
            "v1/ServiceAccount stackrox/sensor",
            "rbac.authorization.k8s.io/v1/ClusterRole stackrox:view-cluster",
            "apps/v1/Deployment stackrox/sensor",
        ]
    );
}

#[test]
fn archive_and_directory_bundles_agree() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("bundle");
    fs::create_dir(&src).unwrap();
    write_bundle(&src);

    let archive = dir.path().join("bundle.tar.gz");
    let mut builder = tar::Builder::new(GzEncoder::new(fs::File::create(&archive).unwrap(), Compression::default()));
    for name in ["ca.pem", "sensor-cert.pem", "sensor-key.pem", "collector-cert.pem", "collector-key.pem", "sensor.yaml", "sensor-rbac.yaml", "NOTES.txt", "sensor.sh"] {
        builder.append_path_with_name(src.join(name), format!("./{}", name)).unwrap();
    }
    builder.append_path_with_name(src.join("additional-cas/corp.crt"), "additional-cas/corp.crt").unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    let cfg = UpgraderConfig::new("p1", "stackrox");
    let reg = BundleRegistry::default();
    let from_dir = instantiate(load_bundle(&src).unwrap().as_ref(), &reg, &cfg).unwrap();
    let from_tar = instantiate(load_bundle(&archive).unwrap().as_ref(), &reg, &cfg).unwrap();
    assert_eq!(from_dir, from_tar);
}

#[test]
fn stray_file_fails_instantiation() {
    let dir = tempfile::tempdir().unwrap();
    write_bundle(dir.path());
    fs::write(dir.path().join("leftover.json"), "{}").unwrap();
    let contents = load_bundle(dir.path()).unwrap();
    let err = instantiate(contents.as_ref(), &BundleRegistry::default(), &UpgraderConfig::new("p1", "stackrox")).unwrap_err();
    assert!(err.to_string().contains("leftover.json"), "{}", err);
}
