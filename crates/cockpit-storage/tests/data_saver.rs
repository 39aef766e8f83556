//! End-to-end saving through the event bus.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cockpit_core::events::{new_image, USER_ABORT};
use cockpit_core::{EventBus, EventPayload, Image};
use cockpit_storage::dv_header::{EXT_BYTES_PER_PLANE, HEADER_BYTES};
use cockpit_storage::{DataSaver, DvHeader, PlaneMetadata, SaverCamera};

fn camera(name: &str, images_per_rep: u32, ignored: &[u32]) -> SaverCamera {
    SaverCamera {
        name: name.to_string(),
        width: 2,
        height: 2,
        images_per_rep,
        ignored: ignored.iter().copied().collect::<BTreeSet<_>>(),
        excitation: Some(488.0),
        emission: Some(525.0),
    }
}

fn publish(bus: &EventBus, camera: &str, value: u16, timestamp: f64) {
    bus.publish(
        &new_image(camera),
        EventPayload::Image {
            camera: camera.to_string(),
            image: Arc::new(Image::from_u16(2, 2, vec![value, value, value, value + 1])),
            timestamp,
        },
    );
}

fn plane_value(bytes: &[u8], next: u64, plane: u64) -> u16 {
    let offset = (HEADER_BYTES + next + plane * 8) as usize;
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[tokio::test]
async fn ignored_images_are_dropped_and_planes_placed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zstack.dv");
    let bus = Arc::new(EventBus::new());
    let mut saver = DataSaver::builder()
        .save_path(&path)
        .camera(camera("cam", 3, &[1]))
        .num_reps(2)
        .titles(vec!["Z-stack".to_string()])
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    saver.start_collecting(&bus);

    for (i, value) in [100u16, 10, 20, 100, 30, 40].into_iter().enumerate() {
        publish(&bus, "cam", value, 5.0 + i as f64);
    }

    let files = saver.execute_and_save(async {}).await.unwrap();
    assert_eq!(files, vec![path.clone()]);
    assert_eq!(bus.subscriber_count(&new_image("cam")), 0);

    let bytes = std::fs::read(&path).unwrap();
    let header = DvHeader::from_bytes(&bytes).unwrap();
    assert_eq!(header.num, [2, 2, 4]);
    assert_eq!(header.num_times, 2);
    assert_eq!(header.titles, vec!["Z-stack".to_string()]);
    let next = header.next as u64;
    assert_eq!(next, 4 * EXT_BYTES_PER_PLANE);
    assert_eq!(header.mmm1, [10.0, 41.0, 0.0]);

    let values: Vec<u16> = (0..4).map(|p| plane_value(&bytes, next, p)).collect();
    assert_eq!(values, vec![10, 20, 30, 40]);
    assert_eq!(bytes.len() as u64, HEADER_BYTES + next + 4 * 8);

    let last = &bytes[(HEADER_BYTES + 3 * EXT_BYTES_PER_PLANE) as usize..];
    let meta = PlaneMetadata::from_bytes(&last[..EXT_BYTES_PER_PLANE as usize]).unwrap();
    assert_eq!(meta.elapsed, 4.0);
    assert_eq!(meta.min, 40.0);
    assert_eq!(meta.excitation, 488.0);
}

#[tokio::test]
async fn two_cameras_interleave_by_wavelength() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two.dv");
    let bus = Arc::new(EventBus::new());
    let mut saver = DataSaver::builder()
        .save_path(&path)
        .camera(camera("a", 2, &[]))
        .camera(camera("b", 1, &[]))
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    saver.start_collecting(&bus);
    publish(&bus, "a", 1, 0.0);
    publish(&bus, "b", 7, 0.0);
    publish(&bus, "a", 2, 0.1);

    saver.execute_and_save(async {}).await.unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let header = DvHeader::from_bytes(&bytes).unwrap();
    let next = header.next as u64;
    // WZT: a z0, b z0, a z1, (b z1 empty)
    assert_eq!(plane_value(&bytes, next, 0), 1);
    assert_eq!(plane_value(&bytes, next, 1), 7);
    assert_eq!(plane_value(&bytes, next, 2), 2);
    assert_eq!(header.mm[0], [7.0, 8.0]);
}

#[tokio::test]
async fn waits_for_execution_before_finishing() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let mut saver = DataSaver::builder()
        .save_path(dir.path().join("late.dv"))
        .camera(camera("cam", 1, &[]))
        .num_reps(2)
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    saver.start_collecting(&bus);

    let producer = Arc::clone(&bus);
    let execution = async move {
        for i in 0..2u16 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            publish(&producer, "cam", i, f64::from(i));
        }
    };
    let files = saver.execute_and_save(execution).await.unwrap();
    let bytes = std::fs::read(&files[0]).unwrap();
    let next = DvHeader::from_bytes(&bytes).unwrap().next as u64;
    assert_eq!(plane_value(&bytes, next, 1), 1);
}

#[tokio::test]
async fn abort_stops_saving_while_experiment_hangs() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let mut saver = DataSaver::builder()
        .save_path(dir.path().join("aborted.dv"))
        .camera(camera("cam", 5, &[]))
        .build()
        .unwrap();
    saver.start_collecting(&bus);

    let aborter = Arc::clone(&bus);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        aborter.publish(USER_ABORT, EventPayload::None);
    });
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        saver.execute_and_save(std::future::pending::<()>()),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn split_files_hold_their_own_timepoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("split.dv");
    let bus = Arc::new(EventBus::new());
    // One 8-byte plane per rep, cap of 8 bytes: one rep per file.
    let mut saver = DataSaver::builder()
        .save_path(&path)
        .camera(camera("cam", 1, &[]))
        .num_reps(3)
        .max_filesize_mb(Some(8.0 / (1024.0 * 1024.0)))
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    saver.start_collecting(&bus);
    for i in 0..3u16 {
        publish(&bus, "cam", 10 + i, f64::from(i));
    }
    let files = saver.execute_and_save(async {}).await.unwrap();
    assert_eq!(files.len(), 3);
    for (i, file) in files.iter().enumerate() {
        let bytes = std::fs::read(file).unwrap();
        let header = DvHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.num_times, 1);
        assert_eq!(
            header.titles,
            vec![format!("File {} of 3; base timepoint {}", i + 1, i)]
        );
        assert_eq!(plane_value(&bytes, header.next as u64, 0), 10 + i as u16);
    }
}
