//! End-to-end engine tests over real (sparse) device files.

use asupersync::Cx;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use strata_io::OpenFlags;
use strata_types::StoreUuid;
use strata_vol::{CachePolicy, Config, Engine, VolCompletion, VolOp, VolParams};

const PAGE: u32 = 8192;
const SYSTEM_UUID: StoreUuid = StoreUuid(0xE2E0_0001);

fn make_device_files(dir: &tempfile::TempDir, count: usize, bytes: u64) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.path().join(format!("dev{i}.img"));
            let file = std::fs::File::create(&path).unwrap();
            // Sparse: the engine only ever touches what it writes.
            file.set_len(bytes).unwrap();
            path
        })
        .collect()
}

fn file_config(devices: Vec<PathBuf>) -> Config {
    Config {
        devices,
        open_flags: OpenFlags::Buffered,
        min_virtual_page_size: 4096,
        app_mem_size: 64 * 1024 * 1024,
        disk_init: true,
        is_file: true,
        system_uuid: SYSTEM_UUID,
        nmirrors: 1,
        chunk_size: 0, // auto-size to the device
        cache_policy: CachePolicy::WriteThrough,
    }
}

#[test]
fn fresh_init_single_write_read() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    // Two 4 GiB devices, written sparsely.
    let devices = make_device_files(&dir, 2, 4 << 30);
    let engine = Engine::open(&cx, &file_config(devices)).unwrap();

    let vol = engine
        .create_volume(&VolParams {
            name: "vol0".to_owned(),
            size: 512 << 20,
            page_size: PAGE,
            uuid: StoreUuid(1),
        })
        .unwrap();

    let (tx, rx) = mpsc::channel::<VolCompletion>();
    let tx = Mutex::new(tx);
    vol.attach_completion_cb(Arc::new(move |comp| {
        let _ = tx.lock().send(comp);
    }));

    // Write 16 blocks of 0xAB at LBA 0.
    engine
        .write(&vol, 0, vec![0xAB; 16 * PAGE as usize], 16, 1001)
        .unwrap();
    let comp = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(comp.request_id, 1001);
    assert_eq!(comp.op, VolOp::Write);
    comp.result.expect("write completes");

    // Read them back: 131072 bytes of 0xAB.
    engine.read(&vol, 0, 16, 1002).unwrap();
    let comp = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(comp.request_id, 1002);
    assert_eq!(comp.op, VolOp::Read);
    let data = comp.data.expect("read payload");
    assert_eq!(data.len(), 131_072);
    assert!(data.iter().all(|b| *b == 0xAB));

    engine.shutdown(&cx).unwrap();
}

#[test]
fn data_survives_engine_restart() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let devices = make_device_files(&dir, 2, 64 << 20);

    let mut cfg = file_config(devices);
    let engine = Engine::open(&cx, &cfg).unwrap();
    let vol = engine
        .create_volume(&VolParams {
            name: "vol0".to_owned(),
            size: 16 << 20,
            page_size: PAGE,
            uuid: StoreUuid(1),
        })
        .unwrap();
    let bytes = vec![0x4D_u8; 8 * PAGE as usize];
    vol.write_sync(&cx, 0, &bytes, 8).unwrap();
    engine.shutdown(&cx).unwrap();
    drop(engine);

    // Reopen without formatting: headers and chunk layout must load.
    cfg.disk_init = false;
    let engine = Engine::open(&cx, &cfg).unwrap();
    engine.shutdown(&cx).unwrap();
}

#[test]
fn write_back_policy_end_to_end() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let devices = make_device_files(&dir, 2, 64 << 20);

    let mut cfg = file_config(devices);
    cfg.cache_policy = CachePolicy::WriteBack;
    let engine = Engine::open(&cx, &cfg).unwrap();
    let vol = engine
        .create_volume(&VolParams {
            name: "wb".to_owned(),
            size: 16 << 20,
            page_size: PAGE,
            uuid: StoreUuid(2),
        })
        .unwrap();

    let bytes = vec![0xB4_u8; 4 * PAGE as usize];
    vol.write_sync(&cx, 8, &bytes, 4).unwrap();
    let out = vol.read_sync(&cx, 8, 4).unwrap();
    assert!(out.iter().all(|b| *b == 0xB4));

    // Shutdown drains the dirty queue through the flush daemon.
    engine.shutdown(&cx).unwrap();
}

#[test]
fn mirrored_write_survives_either_device() {
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let devices = make_device_files(&dir, 2, 64 << 20);

    let mut cfg = file_config(devices);
    cfg.nmirrors = 2;
    let engine = Engine::open(&cx, &cfg).unwrap();
    let vol = engine
        .create_volume(&VolParams {
            name: "mirrored".to_owned(),
            size: 16 << 20,
            page_size: PAGE,
            uuid: StoreUuid(3),
        })
        .unwrap();

    let bytes = vec![0x5E_u8; 2 * PAGE as usize];
    vol.write_sync(&cx, 0, &bytes, 2).unwrap();
    let out = vol.read_sync(&cx, 0, 2).unwrap();
    assert!(out.iter().all(|b| *b == 0x5E));
    engine.shutdown(&cx).unwrap();
}
