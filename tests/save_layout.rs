use image::{Rgb, RgbImage};
use maskforge::mask::{PromptStroke, POSITIVE_STROKE};
use maskforge::output::{encode_jpeg, LabelFolderSink, OutputSink};
use maskforge::segmentation::ScriptedBackend;
use maskforge::{Action, Session, SessionConfig, SessionError, ViewMode};

fn annotated_session(root: &std::path::Path) -> Session {
    let config = SessionConfig {
        save_root: root.to_path_buf(),
        ..SessionConfig::default()
    };
    let mut session = Session::new(Box::new(ScriptedBackend::new()), config);
    session
        .upload(RgbImage::from_pixel(12, 12, Rgb([90, 120, 150])))
        .unwrap();
    session
        .apply(Action::Stroke(PromptStroke::new(
            vec![(3.0, 3.0), (8.0, 3.0)],
            3.0,
            POSITIVE_STROKE,
        )))
        .unwrap();
    session
}

#[test]
fn saves_are_numbered_under_label_directory() {
    let root = tempfile::tempdir().unwrap();
    let session = annotated_session(root.path());

    let first = session.save(ViewMode::Image, "cat").unwrap();
    let second = session.save(ViewMode::ColorMasks, "cat").unwrap();

    assert_eq!(first, root.path().join("cat").join("0.png"));
    assert_eq!(second, root.path().join("cat").join("1.png"));

    let reread = image::open(&first).unwrap().to_rgb8();
    assert_eq!(&reread, session.composites().unwrap().overlay());
}

#[test]
fn cutout_is_saved_with_union_alpha() {
    let root = tempfile::tempdir().unwrap();
    let session = annotated_session(root.path());

    let path = session.save(ViewMode::Masks, "object").unwrap();
    let saved = image::open(&path).unwrap().to_rgba8();
    let union = session.composites().unwrap().union_mask();

    assert_eq!(saved.get_pixel(5, 3).0, [90, 120, 150, 255]);
    assert_eq!(saved.get_pixel(10, 10).0, [0, 0, 0, 0]);
    for (x, y, px) in saved.enumerate_pixels() {
        assert_eq!(px[3] == 255, union.get(x, y));
    }
}

#[test]
fn save_failures_are_reported() {
    let root = tempfile::tempdir().unwrap();
    let mut session = annotated_session(root.path());

    assert!(matches!(
        session.save(ViewMode::Image, ""),
        Err(SessionError::Precondition(_))
    ));

    let missing = root.path().join("does-not-exist");
    let err = session.set_save_root(&missing).unwrap_err();
    assert_eq!(err.code(), "IO_ERROR");
    assert_eq!(session.config().save_root, root.path());

    let elsewhere = tempfile::tempdir().unwrap();
    session.set_save_root(elsewhere.path()).unwrap();
    let path = session.save(ViewMode::WhiteMasks, "dog").unwrap();
    assert!(path.starts_with(elsewhere.path()));
}

#[test]
fn save_before_upload_is_a_precondition_failure() {
    let root = tempfile::tempdir().unwrap();
    let mut sink = LabelFolderSink::new(root.path()).unwrap();
    let session = Session::new(Box::new(ScriptedBackend::new()), SessionConfig::default());

    let err = session.save_to(&mut sink, ViewMode::Image, "cat").unwrap_err();
    assert_eq!(err.code(), "PRECONDITION");
    assert!(!root.path().join("cat").exists());

    // the sink itself stays usable
    let written = sink
        .write_image("cat", &image::DynamicImage::ImageRgb8(RgbImage::new(2, 2)))
        .unwrap();
    assert!(written.is_file());
}

#[test]
fn responses_encode_as_jpeg() {
    let root = tempfile::tempdir().unwrap();
    let mut session = annotated_session(root.path());
    let view = session.apply(Action::Show(ViewMode::ComposeMasks)).unwrap();
    let bytes = encode_jpeg(view).unwrap();

    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (24, 12));
}
