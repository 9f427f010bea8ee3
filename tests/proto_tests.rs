//! Wire-format stability tests for the control protocol.

use chef::build::{ArtifactKind, BuildStatus};
use chef::platform::Arch;
use chef::proto::{
    CvdRequest, CvdResponse, Hello, LayerSpec, ServeRequest, ServeResponse, WaiterRequest,
    WaiterResponse,
};

#[test]
fn test_serve_request_wire_shape() {
    let json = r#"{"method":"install_from_store","package":"acme/hello","revision":7}"#;
    let request: ServeRequest = serde_json::from_str(json).unwrap();
    match request {
        ServeRequest::InstallFromStore {
            package,
            channel,
            revision,
        } => {
            assert_eq!(package, "acme/hello");
            assert!(channel.is_none());
            assert_eq!(revision, Some(7));
        }
        other => panic!("unexpected request: {:?}", other),
    }

    let json = serde_json::to_string(&ServeRequest::ListCount).unwrap();
    assert_eq!(json, r#"{"method":"list_count"}"#);
}

#[test]
fn test_cvd_create_wire_shape() {
    let json = r#"{
        "method": "create",
        "id": "build-1",
        "layers": [
            {"kind": "base", "dir": "/srv/rootfs"},
            {"kind": "bind", "source": "/var/cache", "target": "/ingredients",
             "read_only": true},
            {"kind": "upper", "dir": "/tmp/scratch"}
        ],
        "policy": {"level": "default"}
    }"#;
    let request: CvdRequest = serde_json::from_str(json).unwrap();
    match request {
        CvdRequest::Create {
            id,
            layers,
            policy,
            hostname,
        } => {
            assert_eq!(id, "build-1");
            assert_eq!(layers.len(), 3);
            assert!(matches!(layers[0], LayerSpec::Base { .. }));
            assert!(policy.fs_rules.is_empty());
            assert!(hostname.is_none());
        }
        other => panic!("unexpected request: {:?}", other),
    }
}

#[test]
fn test_cvd_error_carries_taxonomy_kind() {
    let response = CvdResponse::Error {
        kind: chef::ErrorKind::NotRunning,
        message: "container 'x' is not running".into(),
    };
    let json = serde_json::to_string(&response).unwrap();
    assert!(json.contains("\"kind\":\"not-running\""));
    let back: CvdResponse = serde_json::from_str(&json).unwrap();
    assert!(matches!(
        back,
        CvdResponse::Error {
            kind: chef::ErrorKind::NotRunning,
            ..
        }
    ));
}

#[test]
fn test_waiter_round_trip() {
    let request = WaiterRequest::Build {
        arch: Arch::Arm64,
        platform: "linux".into(),
        source_url: "file:///src/hello".into(),
        recipe_path: "recipe.yaml".into(),
    };
    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"arch\":\"arm64\""));

    let response = WaiterResponse::Status {
        arch: Some(Arch::Arm64),
        status: BuildStatus::Building,
    };
    let json = serde_json::to_string(&response).unwrap();
    let back: WaiterResponse = serde_json::from_str(&json).unwrap();
    assert!(matches!(
        back,
        WaiterResponse::Status {
            status: BuildStatus::Building,
            ..
        }
    ));

    let request = WaiterRequest::Artifact {
        id: "Q1".into(),
        kind: ArtifactKind::Log,
    };
    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"kind\":\"log\""));
}

#[test]
fn test_hello_discriminates_roles() {
    let cook: Hello = serde_json::from_str(r#"{"role":"cook"}"#).unwrap();
    assert!(matches!(cook, Hello::Cook));
    let client: Hello = serde_json::from_str(r#"{"role":"client"}"#).unwrap();
    assert!(matches!(client, Hello::Client));
    assert!(serde_json::from_str::<Hello>(r#"{"role":"stranger"}"#).is_err());
}

#[test]
fn test_serve_response_app_payload() {
    let response = ServeResponse::Count { count: 3 };
    let json = serde_json::to_string(&response).unwrap();
    assert_eq!(json, r#"{"result":"count","count":3}"#);
}
