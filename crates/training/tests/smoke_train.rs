use std::fs;
use std::path::Path;

use training::util::{resolve_backend_choice, run_train};
use training::{BackendKind, TrainArgs};

fn args_for(root: &Path, out: &Path) -> TrainArgs {
    TrainArgs {
        run_name: "smoke".into(),
        dataset_root: root.display().to_string(),
        classes_path: None,
        backend: BackendKind::NdArray,
        grid_size: 7,
        slots_per_cell: 2,
        image_size: 32,
        batch_size: 2,
        epochs: 1,
        lr: 1e-3,
        lambda_coord: 5.0,
        lambda_noobj: 0.5,
        val_ratio: 0.0,
        seed: Some(11),
        workers: 1,
        prefetch: 1,
        max_nonfinite_batches: 3,
        checkpoint_out: out.join("model.bin").display().to_string(),
        summary_out: out.join("summary.json").display().to_string(),
    }
}

fn write_sample(root: &Path, stem: &str, cx: f32, cy: f32) {
    let image_rel = format!("images/{stem}.png");
    let img = image::RgbImage::from_fn(32, 32, |x, y| image::Rgb([x as u8 * 8, y as u8 * 8, 64]));
    img.save(root.join(&image_rel)).unwrap();
    let label = format!(
        r#"{{"image":"{image_rel}","objects":[{{"class_id":0,"cx":{cx},"cy":{cy},"w":0.5,"h":0.5}}]}}"#
    );
    fs::write(root.join(format!("labels/{stem}.json")), label).unwrap();
}

#[test]
fn missing_dataset_root_fails_fast() {
    let out = tempfile::tempdir().unwrap();
    let args = args_for(Path::new("/nonexistent/dataset"), out.path());
    let err = run_train(args).unwrap_err();
    assert!(err.to_string().contains("dataset root"));
}

#[test]
fn wgpu_without_feature_falls_back_with_report() {
    #[cfg(not(feature = "backend-wgpu"))]
    {
        let device = resolve_backend_choice(BackendKind::Wgpu);
        assert!(device.contains("fallback"));
        assert_eq!(resolve_backend_choice(BackendKind::NdArray), "ndarray (cpu)");
    }
    #[cfg(feature = "backend-wgpu")]
    assert_eq!(resolve_backend_choice(BackendKind::Wgpu), "wgpu");
}

#[test]
fn zero_epochs_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut args = args_for(dir.path(), dir.path());
    args.epochs = 0;
    assert!(run_train(args).is_err());
}

#[test]
fn zero_nonfinite_budget_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut args = args_for(dir.path(), dir.path());
    args.max_nonfinite_batches = 0;
    let err = run_train(args).unwrap_err();
    assert!(err.to_string().contains("non-finite"));
}

#[test]
fn tiny_run_trains_and_writes_summary() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("labels")).unwrap();
    fs::create_dir_all(root.join("images")).unwrap();
    fs::write(root.join("classes.txt"), "thing\n").unwrap();
    write_sample(root, "0000", 0.5, 0.5);
    write_sample(root, "0001", 0.25, 0.75);

    let out = tempfile::tempdir().unwrap();
    let args = args_for(root, out.path());
    run_train(args).unwrap();

    let summary = training::TrainingSummary::load(&out.path().join("summary.json")).unwrap();
    assert_eq!(summary.run_name, "smoke");
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.train_samples, 2);
    assert_eq!(summary.val_samples, 0);
    assert_eq!(summary.classes, vec!["thing".to_string()]);
    assert_eq!(summary.train_loss.len(), 1);
    assert!(summary.train_loss[0].is_finite());
    assert!(out.path().join("model.bin").exists());
}
