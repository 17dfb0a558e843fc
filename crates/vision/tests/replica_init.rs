mod common;

use std::{
    fs,
    sync::{Arc, atomic::Ordering},
};

use common::{FakeRuntime, bgr_frame, model_file, shared};
use ml_core::NpuCore;
use vision::{DetectorConfig, InitError, ModelReplica, PoolError, spawn_detection_pool};

#[test]
fn model_is_loaded_once_and_duplicated_for_the_rest() {
    let model = model_file();
    let runtime = Arc::new(FakeRuntime::new(64, 48));
    let config = DetectorConfig::new(model.path()).with_replicas(4);
    let pool = spawn_detection_pool(shared(runtime.clone(), config)).unwrap();

    assert_eq!(runtime.stats.loads.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.stats.duplicates.load(Ordering::SeqCst), 3);

    let first = pool.replica(0).unwrap();
    for i in 1..pool.replica_count() {
        let replica = pool.replica(i).unwrap();
        assert_eq!(replica.output_attrs(), first.output_attrs());
        assert_eq!(replica.input_shape(), first.input_shape());
    }

    let cores: Vec<NpuCore> = (0..4).map(|i| pool.replica(i).unwrap().core()).collect();
    assert_eq!(
        cores,
        vec![NpuCore::Core0, NpuCore::Core1, NpuCore::Core2, NpuCore::Core0]
    );
}

#[test]
fn missing_or_empty_model_fails_initialisation() {
    let runtime = Arc::new(FakeRuntime::new(64, 48));
    let missing = DetectorConfig::new("/nonexistent/model.rknn");
    assert!(matches!(
        spawn_detection_pool(shared(runtime.clone(), missing)),
        Err(PoolError::Init(InitError::ModelRead { .. }))
    ));

    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.rknn");
    fs::write(&empty, b"").unwrap();
    assert!(matches!(
        spawn_detection_pool(shared(runtime.clone(), DetectorConfig::new(&empty))),
        Err(PoolError::Init(InitError::EmptyModel(_)))
    ));
    assert_eq!(runtime.stats.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn standalone_replica_detects_and_keeps_frame_geometry() {
    let model = model_file();
    let runtime = Arc::new(FakeRuntime::new(64, 64));
    let shared = shared(runtime, DetectorConfig::new(model.path()));
    let replica = ModelReplica::init(0, shared, None).unwrap();

    let annotated = replica.infer(bgr_frame(160, 90, 42)).expect("frame");
    assert_eq!(annotated.frame.size(), (160, 90));
    assert_eq!(annotated.frame.timestamp_ms, 42);
    assert_eq!(annotated.core, NpuCore::Core0);
    assert!(annotated.detections.is_empty());
}
