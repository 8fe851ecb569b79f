//! Security tests
//!
//! Permission enforcement through module contexts, artifact verification
//! on install and resource limits.

mod common;

use std::sync::Arc;

use common::*;

use cdmf::security::{
    DigestVerifier, Permission, PermissionType, ResourceKind, ResourceLimit, TrustedSigner,
    SYSTEM_PRINCIPAL,
};
use cdmf::{CdmfError, ModuleContext, ModuleManifest, Properties};

/// Install and start `name`, handing its context back to the test
fn started_context(
    framework: &cdmf::Framework,
    manifest: ModuleManifest,
) -> ModuleContext {
    let slot = Arc::new(parking_lot::Mutex::new(None));
    let sink = slot.clone();
    let log = CallLog::new();
    let name = manifest.name.clone();
    framework
        .install_activator(
            manifest,
            TestActivator::new(&name, &log)
                .on_start(move |ctx| {
                    *sink.lock() = Some(ctx.clone());
                    Ok(())
                })
                .shared(),
        )
        .unwrap();
    framework.modules().start(&name).unwrap();
    let ctx = slot.lock().take().unwrap();
    ctx
}

#[test]
fn test_permission_file_loaded_on_start() {
    let fixture = ModuleDirFixture::new();
    let path = fixture.path().join("modules.perm");
    std::fs::write(
        &path,
        "# granted at start\n[auditor]\nPROPERTY_WRITE:audit.*:GRANT\n",
    )
    .unwrap();
    let framework = test_framework_with(|c| {
        c.security.permissions_file = Some(path.clone());
        c.modules.modules_dir = fixture.modules_dir.clone();
    });
    framework.start().unwrap();

    let ctx = started_context(&framework, ModuleManifest::new("auditor", "1.0.0"));
    assert!(ctx.create_configuration("audit.log").is_ok());
}

#[test]
fn test_default_permissions_apply() {
    let framework = test_framework();
    let ctx = started_context(&framework, ModuleManifest::new("plain", "1.0.0"));

    assert!(ctx.register("IAnything", 1u8, Properties::new()).is_ok());
    assert!(ctx.get_service("IAnything", None).unwrap().is_some());
    assert!(matches!(
        ctx.create_configuration("plain.settings"),
        Err(CdmfError::PermissionDenied(_))
    ));
    assert!(matches!(
        ctx.start_module("plain"),
        Err(CdmfError::PermissionDenied(_))
    ));
}

#[test]
fn test_deny_dominates_grant() {
    let framework = test_framework();
    let ctx = started_context(
        &framework,
        ModuleManifest::new("restricted", "1.0.0").permission("SERVICE_REGISTER:com.acme.*:DENY"),
    );

    assert!(matches!(
        ctx.register("com.acme.Secret", 1u8, Properties::new()),
        Err(CdmfError::PermissionDenied(_))
    ));
    assert!(ctx.register("org.other.Public", 1u8, Properties::new()).is_ok());

    // A later GRANT on the exact target does not lift the DENY
    framework
        .permissions()
        .grant(
            "restricted",
            Permission::grant(PermissionType::ServiceRegister, "com.acme.Secret"),
        )
        .unwrap();
    assert!(ctx
        .register("com.acme.Secret", 1u8, Properties::new())
        .is_err());
}

#[test]
fn test_manifest_permissions_granted() {
    let framework = test_framework();
    let log = CallLog::new();
    framework
        .install_activator(
            ModuleManifest::new("worker", "1.0.0"),
            TestActivator::new("worker", &log).shared(),
        )
        .unwrap();
    let ctx = started_context(
        &framework,
        ModuleManifest::new("supervisor", "1.0.0")
            .permission("MODULE_EXECUTE:worker:GRANT")
            .permission("PROPERTY_WRITE:supervisor.*:GRANT"),
    );

    ctx.start_module("worker").unwrap();
    assert!(log.entries().contains(&"start:worker".to_string()));
    ctx.stop_module("worker").unwrap();

    let config = ctx.create_configuration("supervisor.limits").unwrap();
    assert_eq!(config.pid(), "supervisor.limits");
    assert!(matches!(
        ctx.create_configuration("other.limits"),
        Err(CdmfError::PermissionDenied(_))
    ));
    assert!(matches!(
        ctx.uninstall_module("worker"),
        Err(CdmfError::PermissionDenied(_))
    ));
}

#[test]
fn test_revoke_through_store() {
    let framework = test_framework();
    let ctx = started_context(&framework, ModuleManifest::new("muted", "1.0.0"));
    assert!(ctx.publish_event(cdmf::Event::new("app/ping")).is_ok());

    framework
        .permissions()
        .grant(
            "muted",
            "EVENT_PUBLISH:*:REVOKE".parse::<Permission>().unwrap(),
        )
        .unwrap();
    assert!(matches!(
        ctx.publish_event(cdmf::Event::new("app/ping")),
        Err(CdmfError::PermissionDenied(_))
    ));
}

#[test]
fn test_enforcement_can_be_disabled() {
    let framework = test_framework_with(|c| c.security.enforce_permissions = false);
    let ctx = started_context(&framework, ModuleManifest::new("free", "1.0.0"));
    assert!(ctx.create_configuration("free.settings").is_ok());
}

#[test]
fn test_install_needs_module_load() {
    let framework = test_framework();
    let fixture = ModuleDirFixture::new();
    let dir = fixture.create_module("plugin", "1.0.0", b"not a library");

    let ctx = started_context(&framework, ModuleManifest::new("installer", "1.0.0"));
    assert!(matches!(
        ctx.install_module(&dir),
        Err(CdmfError::PermissionDenied(_))
    ));
    assert!(framework.modules().get_module("plugin").is_none());
}

#[test]
fn test_install_rejects_bad_artifact() {
    let framework = test_framework();
    let fixture = ModuleDirFixture::new();
    let dir = fixture.create_module("plugin", "1.0.0", b"not a library");

    // The system principal passes verification and the permission check,
    // so the failure comes from loading the library
    let err = framework.install(&dir).unwrap_err();
    assert!(matches!(err, CdmfError::ArtifactLoad(_)), "{err}");
    assert!(framework.modules().is_empty());
}

#[test]
fn test_required_signature() {
    let framework = test_framework_with(|c| c.security.require_signature = true);
    let fixture = ModuleDirFixture::new();
    let dir = fixture.create_module("plugin", "1.0.0", b"plugin bytes");

    let err = framework.install(&dir).unwrap_err();
    assert!(matches!(err, CdmfError::VerifyFailed(_)), "{err}");

    // Signed by an unknown signer
    let library = fixture.library_path("plugin");
    DigestVerifier::write_signature(&library, "ab12", None).unwrap();
    assert!(matches!(
        framework.install(&dir),
        Err(CdmfError::VerifyFailed(_))
    ));

    // Trusted: verification passes and loading is attempted
    framework.signers().add(TrustedSigner {
        name: "release".into(),
        email: "release@example.org".into(),
        key_path: "keys/release.pub".into(),
        fingerprint: "AB12".into(),
        enabled: true,
    });
    assert!(matches!(
        framework.install(&dir),
        Err(CdmfError::ArtifactLoad(_))
    ));
}

#[test]
fn test_resource_limits_through_context() {
    let framework = test_framework();
    let log = CallLog::new();
    record_events(&framework, "cdmf/resource/*", &log);
    framework
        .resources()
        .set_limit("hungry", ResourceLimit::new(ResourceKind::Memory, 100, 200))
        .unwrap();
    let ctx = started_context(&framework, ModuleManifest::new("hungry", "1.0.0"));

    ctx.allocate(ResourceKind::Memory, 150).unwrap();
    assert!(!ctx.can_allocate(ResourceKind::Memory, 100));
    assert!(matches!(
        ctx.allocate(ResourceKind::Memory, 100),
        Err(CdmfError::PermissionDenied(_))
    ));
    ctx.release(ResourceKind::Memory, 150);
    assert!(ctx.can_allocate(ResourceKind::Memory, 100));

    assert!(log
        .entries()
        .iter()
        .any(|e| e.starts_with("cdmf/resource/VIOLATION")));

    framework.modules().uninstall("hungry").unwrap();
    assert!(framework.resources().usages("hungry").is_empty());
}

#[test]
fn test_system_principal_holds_admin() {
    let framework = test_framework();
    for permission_type in PermissionType::ALL {
        assert!(framework
            .permissions()
            .check(SYSTEM_PRINCIPAL, permission_type, "anything"));
    }
}
