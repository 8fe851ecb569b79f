//! Transport tests through module contexts

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;

use cdmf::{CdmfError, ModuleContext, ModuleManifest};

fn context_of(framework: &cdmf::Framework, manifest: ModuleManifest) -> ModuleContext {
    let slot = Arc::new(parking_lot::Mutex::new(None));
    let sink = slot.clone();
    let name = manifest.name.clone();
    framework
        .install_activator(
            manifest,
            TestActivator::new(&name, &CallLog::new())
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modules_talk_in_process() {
    let framework = test_framework();
    let ping = context_of(
        &framework,
        ModuleManifest::new("ping", "1.0.0").permission("IPC_SEND:in-process://*:GRANT"),
    );
    let pong = context_of(
        &framework,
        ModuleManifest::new("pong", "1.0.0").permission("IPC_SEND:in-process://game:GRANT"),
    );

    let a = ping.open_transport("in-process://game").await.unwrap();
    let b = pong.open_transport("in-process://game").await.unwrap();

    a.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));
    b.send(Bytes::from_static(b"pong")).await.unwrap();
    assert_eq!(a.recv().await.unwrap(), Some(Bytes::from_static(b"pong")));

    a.close().await.unwrap();
    assert_eq!(b.recv().await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_transport_needs_ipc_send() {
    let framework = test_framework();
    let ctx = context_of(&framework, ModuleManifest::new("mute", "1.0.0"));
    assert!(matches!(
        ctx.open_transport("in-process://anything").await,
        Err(CdmfError::PermissionDenied(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_scheme() {
    let framework = test_framework();
    assert!(matches!(
        framework.transports().open("carrier-pigeon://coop").await,
        Err(CdmfError::NotFound(_))
    ));
    assert!(matches!(
        framework.transports().open("no-scheme").await,
        Err(CdmfError::InvalidArgument(_))
    ));
}
