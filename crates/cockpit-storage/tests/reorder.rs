//! Structured illumination files rewritten into reconstruction order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cockpit_core::events::new_image;
use cockpit_core::{EventBus, EventPayload, Image};
use cockpit_storage::dv_header::{EXT_BYTES_PER_PLANE, HEADER_BYTES};
use cockpit_storage::{
    reorder_stack, DataSaver, DvHeader, PackedStack, PlaneMetadata, SaverCamera, StackAxis,
    RECONSTRUCTION_ORDER,
};

const Z_ANGLE_PHASE: [StackAxis; 3] = [StackAxis::Z, StackAxis::Angle, StackAxis::Phase];

async fn save(path: &Path, num_reps: u32, values: &[u16]) {
    let bus = Arc::new(EventBus::new());
    let mut saver = DataSaver::builder()
        .save_path(path)
        .camera(SaverCamera {
            name: "cam".into(),
            width: 2,
            height: 2,
            images_per_rep: 4,
            ignored: Default::default(),
            excitation: None,
            emission: Some(525.0),
        })
        .num_reps(num_reps)
        .idle_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    saver.start_collecting(&bus);
    for (i, &value) in values.iter().enumerate() {
        bus.publish(
            &new_image("cam"),
            EventPayload::Image {
                camera: "cam".into(),
                image: Arc::new(Image::from_u16(2, 2, vec![value; 4])),
                timestamp: i as f64,
            },
        );
    }
    saver.execute_and_save(async {}).await.unwrap();
}

fn planes(bytes: &[u8]) -> Vec<u16> {
    let header = DvHeader::from_bytes(bytes).unwrap();
    let start = (HEADER_BYTES + header.next as u64) as usize;
    bytes[start..]
        .chunks(8)
        .map(|plane| u16::from_le_bytes([plane[0], plane[1]]))
        .collect()
}

fn stack(order: [StackAxis; 3]) -> PackedStack {
    PackedStack {
        order,
        angles: 2,
        phases: 1,
        z_slices: 2,
    }
}

#[tokio::test]
async fn planes_and_metadata_move_together() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("si.dv");
    // Collected Z-outermost: z0a0, z0a1, z1a0, z1a1 for two timepoints.
    save(&path, 2, &[1, 2, 3, 4, 5, 6, 7, 8]).await;
    let before = std::fs::read(&path).unwrap();

    assert!(reorder_stack(&path, &stack(Z_ANGLE_PHASE)).unwrap());

    let after = std::fs::read(&path).unwrap();
    assert_eq!(after.len(), before.len());
    assert_eq!(after[..HEADER_BYTES as usize], before[..HEADER_BYTES as usize]);
    assert_eq!(planes(&after), vec![1, 3, 2, 4, 5, 7, 6, 8]);

    let second = (HEADER_BYTES + EXT_BYTES_PER_PLANE) as usize;
    let meta =
        PlaneMetadata::from_bytes(&after[second..second + EXT_BYTES_PER_PLANE as usize]).unwrap();
    assert_eq!(meta.min, 3.0);
    assert_eq!(meta.elapsed, 2.0);
}

#[tokio::test]
async fn truncated_file_is_padded_with_blank_planes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.dv");
    save(&path, 1, &[1, 2, 3]).await;

    reorder_stack(&path, &stack(Z_ANGLE_PHASE)).unwrap();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(planes(&after), vec![1, 3, 2, 0]);
    assert_eq!(after.len() as u64, HEADER_BYTES + 4 * EXT_BYTES_PER_PLANE + 4 * 8);
}

#[tokio::test]
async fn files_already_in_order_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.dv");
    save(&path, 1, &[1, 2, 3, 4]).await;
    let before = std::fs::read(&path).unwrap();

    assert!(!reorder_stack(&path, &stack(RECONSTRUCTION_ORDER)).unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn stack_size_must_match_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odd.dv");
    save(&path, 1, &[1, 2, 3, 4]).await;
    let wrong = PackedStack {
        z_slices: 3,
        ..stack(Z_ANGLE_PHASE)
    };
    let err = reorder_stack(&path, &wrong).unwrap_err();
    assert!(err.is_configuration());
}
