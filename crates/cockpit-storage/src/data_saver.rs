//! Streams camera images of a running experiment into DV files.
//!
//! Cameras publish images on their "new image" events; the saver's callbacks
//! only push onto a queue. [`DataSaver::execute_and_save`] drains the queue,
//! places every kept frame at its (wavelength, z, time) plane, and finishes
//! once the experiment has stopped and images have stopped arriving.
//!
//! Planes are stored in WZT order so the cameras of one z slice are adjacent.
//! When a size cap is configured the repetitions are split across several
//! files named `<path>.<index>`.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use cockpit_core::events::{new_image, EventBus, SubscriptionId, UPDATE_STATUS_LIGHT, USER_ABORT};
use cockpit_core::{AbortToken, CockpitError, CockpitResult, EventPayload, Image};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::dv_header::{
    DvHeader, PlaneMetadata, EXT_BYTES_PER_PLANE, EXT_FLOATS, EXT_INTS, HEADER_BYTES,
};

/// Time without new images after which the saver gives up waiting.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MEGABYTE: f64 = 1024.0 * 1024.0;

/// What the saver needs to know about one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct SaverCamera {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Images the camera produces in one repetition, kept or not.
    pub images_per_rep: u32,
    /// 1-based indices, within a repetition, of images to drop.
    pub ignored: BTreeSet<u32>,
    /// Excitation wavelength in nm.
    pub excitation: Option<f64>,
    /// Emission wavelength in nm.
    pub emission: Option<f64>,
}

impl SaverCamera {
    pub fn kept_per_rep(&self) -> u32 {
        let dropped = self
            .ignored
            .iter()
            .filter(|&&i| i >= 1 && i <= self.images_per_rep)
            .count() as u32;
        self.images_per_rep - dropped
    }
}

#[derive(Debug)]
struct Frame {
    camera: usize,
    image: Arc<Image>,
    timestamp: f64,
}

/// Counters for one saver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaverStats {
    pub received: Vec<u64>,
    pub kept: Vec<u64>,
}

pub struct DataSaverBuilder {
    cameras: Vec<SaverCamera>,
    num_reps: u32,
    save_path: Option<PathBuf>,
    max_filesize_mb: Option<f64>,
    pixel_size_xy: f32,
    pixel_size_z: f32,
    titles: Vec<String>,
    idle_timeout: Duration,
}

impl Default for DataSaverBuilder {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            num_reps: 1,
            save_path: None,
            max_filesize_mb: None,
            pixel_size_xy: 1.0,
            pixel_size_z: 1.0,
            titles: Vec::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl DataSaverBuilder {
    pub fn save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn camera(mut self, camera: SaverCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn cameras(mut self, cameras: Vec<SaverCamera>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn num_reps(mut self, reps: u32) -> Self {
        self.num_reps = reps;
        self
    }

    /// Cap on image bytes per file. The header and extended header are not counted.
    pub fn max_filesize_mb(mut self, cap: Option<f64>) -> Self {
        self.max_filesize_mb = cap;
        self
    }

    pub fn pixel_size(mut self, xy: f32, z: f32) -> Self {
        self.pixel_size_xy = xy;
        self.pixel_size_z = z;
        self
    }

    pub fn titles(mut self, titles: Vec<String>) -> Self {
        self.titles = titles;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Lay out the planes, create the files and write the initial headers.
    pub fn build(self) -> CockpitResult<DataSaver> {
        let save_path = self
            .save_path
            .ok_or_else(|| CockpitError::Configuration("data saver needs a save path".into()))?;
        if self.cameras.is_empty() {
            return Err(CockpitError::Configuration("data saver needs a camera".into()));
        }
        let num_reps = self.num_reps.max(1);
        let num_cameras = self.cameras.len();
        let max_width = self.cameras.iter().map(|c| c.width).max().unwrap_or(0);
        let max_height = self.cameras.iter().map(|c| c.height).max().unwrap_or(0);
        let max_images_per_rep = self
            .cameras
            .iter()
            .map(SaverCamera::kept_per_rep)
            .max()
            .unwrap_or(0);
        if max_images_per_rep == 0 {
            return Err(CockpitError::Configuration(
                "no camera keeps any images".into(),
            ));
        }
        let plane_bytes = u64::from(max_width) * u64::from(max_height) * 2;

        let mut reps_per_file = match self.max_filesize_mb {
            Some(cap) => {
                let rep_mb = f64::from(max_images_per_rep) * plane_bytes as f64
                    * num_cameras as f64
                    / MEGABYTE;
                ((cap / rep_mb).floor() as u32).max(1)
            }
            None => num_reps,
        };
        let split = reps_per_file < num_reps;
        reps_per_file = reps_per_file.min(num_reps);

        let num_files = num_reps.div_ceil(reps_per_file) as usize;
        let filenames: Vec<PathBuf> = if split {
            let digits = ((num_files as f64).log10().ceil() as usize).max(1);
            (0..num_files)
                .map(|i| {
                    let mut name = save_path.as_os_str().to_owned();
                    name.push(format!(".{i:0digits$}"));
                    PathBuf::from(name)
                })
                .collect()
        } else {
            vec![save_path]
        };

        let wavelengths: Vec<Option<f64>> = self.cameras.iter().map(|c| c.emission).collect();
        let mut headers = Vec::with_capacity(num_files);
        let mut files = Vec::with_capacity(num_files);
        for (i, path) in filenames.iter().enumerate() {
            let timepoints = if i + 1 == num_files {
                num_reps - reps_per_file * (num_files as u32 - 1)
            } else {
                reps_per_file
            };
            let mut header = DvHeader::for_shape(
                num_cameras,
                timepoints as usize,
                max_images_per_rep as usize,
                max_height,
                max_width,
                self.pixel_size_xy,
                self.pixel_size_z,
                &wavelengths,
            );
            let mut titles = self.titles.clone();
            if split && titles.len() < 8 {
                titles.push(format!(
                    "File {} of {}; base timepoint {}",
                    i + 1,
                    num_files,
                    i as u32 * reps_per_file
                ));
            }
            header.set_titles(&titles)?;
            header.next = extended_header_bytes(max_images_per_rep, num_cameras, timepoints)?;
            header.num_integers = EXT_INTS as i16;
            header.num_floats = EXT_FLOATS as i16;

            let mut file = create_file(path)?;
            file.write_all(&header.to_bytes()?)?;
            files.push(Mutex::new(file));
            headers.push(header);
        }
        info!(
            files = num_files,
            reps_per_file,
            planes_per_rep = max_images_per_rep,
            "data saver ready"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(DataSaver {
            num_reps,
            max_width,
            max_height,
            max_images_per_rep,
            plane_bytes,
            reps_per_file,
            files: Arc::new(files),
            filenames,
            headers,
            stats: SaverStats {
                received: vec![0; num_cameras],
                kept: vec![0; num_cameras],
            },
            min_max: vec![None; num_cameras],
            first_timestamp: None,
            tx,
            rx,
            subscriptions: Vec::new(),
            bus: None,
            abort: AbortToken::new(),
            idle_timeout: self.idle_timeout,
            cameras: self.cameras,
        })
    }
}

fn create_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

pub struct DataSaver {
    cameras: Vec<SaverCamera>,
    num_reps: u32,
    max_width: u32,
    max_height: u32,
    max_images_per_rep: u32,
    plane_bytes: u64,
    reps_per_file: u32,
    files: Arc<Vec<Mutex<File>>>,
    filenames: Vec<PathBuf>,
    headers: Vec<DvHeader>,
    stats: SaverStats,
    min_max: Vec<Option<(u16, u16)>>,
    first_timestamp: Option<f64>,
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    subscriptions: Vec<(String, SubscriptionId)>,
    bus: Option<Arc<EventBus>>,
    abort: AbortToken,
    idle_timeout: Duration,
}

impl DataSaver {
    pub fn builder() -> DataSaverBuilder {
        DataSaverBuilder::default()
    }

    pub fn filenames(&self) -> &[PathBuf] {
        &self.filenames
    }

    pub fn stats(&self) -> &SaverStats {
        &self.stats
    }

    pub fn headers(&self) -> &[DvHeader] {
        &self.headers
    }

    /// Subscribe to the cameras' image events and to user aborts.
    pub fn start_collecting(&mut self, bus: &Arc<EventBus>) {
        for (index, camera) in self.cameras.iter().enumerate() {
            let event = new_image(&camera.name);
            let tx = self.tx.clone();
            let id = bus.subscribe(&event, move |payload| {
                if let EventPayload::Image {
                    image, timestamp, ..
                } = payload
                {
                    let _ = tx.send(Frame {
                        camera: index,
                        image: Arc::clone(image),
                        timestamp: *timestamp,
                    });
                }
            });
            self.subscriptions.push((event, id));
        }
        let abort = self.abort.clone();
        let id = bus.subscribe(USER_ABORT, move |_| abort.abort());
        self.subscriptions.push((USER_ABORT.to_string(), id));
        self.bus = Some(Arc::clone(bus));
    }

    fn all_images_kept(&self) -> bool {
        self.cameras
            .iter()
            .zip(&self.stats.kept)
            .all(|(camera, &kept)| {
                kept == u64::from(camera.kept_per_rep()) * u64::from(self.num_reps)
            })
    }

    /// Save images until `execution` has finished and the cameras are done.
    ///
    /// After `execution` resolves, saving stops once every camera has
    /// delivered all its kept images, or once no image has arrived for the
    /// idle timeout and the queue is empty. A user abort stops saving at once.
    /// Returns the files written.
    #[instrument(skip_all, fields(files = self.filenames.len()), err)]
    pub async fn execute_and_save<F>(mut self, execution: F) -> CockpitResult<Vec<PathBuf>>
    where
        F: Future<Output = ()>,
    {
        let mut execution = std::pin::pin!(execution);
        let mut executing = true;
        let mut last_image = Instant::now();

        loop {
            if self.abort.is_aborted() {
                warn!("saving aborted");
                break;
            }
            if !executing && self.all_images_kept() {
                break;
            }
            let abort = self.abort.clone();
            tokio::select! {
                _ = &mut execution, if executing => {
                    executing = false;
                    debug!("execution finished, draining images");
                }
                frame = self.rx.recv() => {
                    if let Some(frame) = frame {
                        self.write_frame(frame).await?;
                        last_image = Instant::now();
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL), if !executing => {
                    if last_image.elapsed() >= self.idle_timeout && self.rx.is_empty() {
                        warn!(
                            kept = ?self.stats.kept,
                            "images stopped arriving before every camera finished"
                        );
                        break;
                    }
                }
                _ = abort.aborted() => {}
            }
        }

        self.finish().await
    }

    async fn write_frame(&mut self, frame: Frame) -> CockpitResult<()> {
        let index = frame.camera;
        let Some(camera) = self.cameras.get(index) else {
            return Ok(());
        };
        self.stats.received[index] += 1;
        let received = self.stats.received[index];
        let per_rep = u64::from(camera.images_per_rep.max(1));
        let index_in_rep = ((received - 1) % per_rep) as u32 + 1;
        if camera.ignored.contains(&index_in_rep) {
            debug!(camera = %camera.name, index_in_rep, "dropping ignored image");
            return Ok(());
        }
        let kept_per_rep = u64::from(camera.kept_per_rep());
        if kept_per_rep == 0 {
            return Ok(());
        }

        let kept = self.stats.kept[index];
        let mut timepoint = kept / kept_per_rep;
        if timepoint >= u64::from(self.num_reps) {
            warn!(camera = %camera.name, "more images than expected, dropping");
            return Ok(());
        }
        let file_index = (timepoint / u64::from(self.reps_per_file)) as usize;
        timepoint -= file_index as u64 * u64::from(self.reps_per_file);
        let z_index = kept % kept_per_rep;

        let num_cameras = self.cameras.len() as u64;
        let plane = timepoint * u64::from(self.max_images_per_rep) * num_cameras
            + z_index * num_cameras
            + index as u64;
        let metadata_offset = HEADER_BYTES + plane * EXT_BYTES_PER_PLANE;
        let data_offset = HEADER_BYTES
            + u64::try_from(self.headers[file_index].next).unwrap_or(0)
            + plane * self.plane_bytes;

        let first = *self.first_timestamp.get_or_insert(frame.timestamp);
        let (min, max) = frame.image.min_max().unwrap_or((0, 0));
        let metadata = PlaneMetadata {
            elapsed: (frame.timestamp - first) as f32,
            min: f32::from(min),
            max: f32::from(max),
            excitation: camera.excitation.unwrap_or(0.0) as f32,
            emission: camera.emission.unwrap_or(0.0) as f32,
        }
        .to_bytes()?;
        let plane_data = pad_plane(&frame.image, self.max_width, self.max_height)?;

        let files = Arc::clone(&self.files);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = files[file_index].lock();
            file.seek(SeekFrom::Start(metadata_offset))?;
            file.write_all(&metadata)?;
            file.seek(SeekFrom::Start(data_offset))?;
            file.write_all(&plane_data)
        })
        .await
        .map_err(io::Error::other)??;

        self.stats.kept[index] += 1;
        self.min_max[index] = Some(match self.min_max[index] {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        });
        self.publish_progress();
        Ok(())
    }

    fn publish_progress(&self) {
        let Some(bus) = &self.bus else {
            return;
        };
        let mut text = String::new();
        for (camera, kept) in self.cameras.iter().zip(&self.stats.kept) {
            let total = u64::from(camera.kept_per_rep()) * u64::from(self.num_reps);
            text.push_str(&format!("{}: {}/{}\n", camera.name, kept, total));
        }
        bus.publish(
            UPDATE_STATUS_LIGHT,
            EventPayload::Status {
                light: "image count".to_string(),
                text,
            },
        );
    }

    async fn finish(mut self) -> CockpitResult<Vec<PathBuf>> {
        if let Some(bus) = self.bus.take() {
            for (event, id) in self.subscriptions.drain(..) {
                bus.unsubscribe(&event, id);
            }
            bus.publish(
                UPDATE_STATUS_LIGHT,
                EventPayload::Status {
                    light: "image count".to_string(),
                    text: String::new(),
                },
            );
        }

        // Min/max cover the whole experiment, not each file.
        for header in &mut self.headers {
            for (i, range) in self.min_max.iter().enumerate() {
                if let Some((lo, hi)) = range {
                    header.set_min_max(i, f32::from(*lo), f32::from(*hi));
                }
            }
        }
        let headers: Vec<Vec<u8>> = self
            .headers
            .iter()
            .map(DvHeader::to_bytes)
            .collect::<io::Result<_>>()?;
        let files = Arc::clone(&self.files);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            for (file, header) in files.iter().zip(headers) {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&header)?;
                file.flush()?;
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)??;

        info!(kept = ?self.stats.kept, files = self.filenames.len(), "images saved");
        Ok(self.filenames)
    }
}

/// Plane bytes for `image`, zero padded to `width * height`.
fn pad_plane(image: &Image, width: u32, height: u32) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(width as usize * height as usize * 2);
    for y in 0..height {
        for x in 0..width {
            out.write_u16::<LittleEndian>(image.get(x, y).unwrap_or(0))?;
        }
    }
    Ok(out)
}

impl std::fmt::Debug for DataSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSaver")
            .field("filenames", &self.filenames)
            .field("num_reps", &self.num_reps)
            .field("reps_per_file", &self.reps_per_file)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Size of the per-plane extended header for one file.
fn extended_header_bytes(
    images_per_rep: u32,
    num_cameras: usize,
    timepoints: u32,
) -> CockpitResult<i32> {
    let bytes = EXT_BYTES_PER_PLANE
        .checked_mul(u64::from(images_per_rep))
        .and_then(|b| b.checked_mul(num_cameras as u64))
        .and_then(|b| b.checked_mul(u64::from(timepoints)));
    bytes
        .and_then(|b| i32::try_from(b).ok())
        .ok_or_else(|| {
            CockpitError::Configuration(format!(
                "{timepoints} timepoints of {images_per_rep} images from {num_cameras} cameras \
                 overflow the extended header; set a maximum file size"
            ))
        })
}
