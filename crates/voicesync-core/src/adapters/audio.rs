//! Audio adapter: microphone capture, Opus encode/decode, and playout.
//!
//! Capture opens the default input device at its native format on a
//! dedicated OS thread, downmixes to mono into a ring buffer, and a frame
//! loop turns that into 20 ms batches: each batch is broadcast raw (for
//! speaking detection and visualization) and Opus-encoded into the local
//! WebRTC track. Playout runs the reverse path: per-peer readers decode
//! remote tracks into a mixer, and a 20 ms loop mixes everyone into the
//! default output device.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate as OpusSampleRate};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::application::ports::{AudioAdapter, LocalAudioTrack, RemoteAudioTrack, SampleBatch};
use crate::domain::error::AudioError;
use crate::domain::identity::PeerId;

/// Internal processing rate (Hz); everything is resampled to/from this.
const OPUS_SAMPLE_RATE: u32 = 48_000;
/// Samples per 20 ms frame at 48 kHz.
const FRAME_SAMPLES: usize = 960;
/// Frames buffered per remote peer before old ones are dropped.
const MAX_REMOTE_FRAMES: usize = 16;

type MixerBuffers = Arc<Mutex<HashMap<PeerId, VecDeque<Vec<f32>>>>>;

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct CpalAudioAdapter {
    muted: Arc<AtomicBool>,
    /// Read by the device threads; set once on stop.
    stopped: Arc<AtomicBool>,
    cancel: CancellationToken,
    samples_tx: broadcast::Sender<SampleBatch>,
    track: Mutex<Option<LocalAudioTrack>>,
    capture_running: AtomicBool,
    playout_running: AtomicBool,
    mixer: MixerBuffers,
    remotes: Mutex<HashMap<PeerId, CancellationToken>>,
}

impl CpalAudioAdapter {
    pub fn new() -> Arc<Self> {
        let (samples_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            muted: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            samples_tx,
            track: Mutex::new(None),
            capture_running: AtomicBool::new(false),
            playout_running: AtomicBool::new(false),
            mixer: Arc::new(Mutex::new(HashMap::new())),
            remotes: Mutex::new(HashMap::new()),
        })
    }

    fn ensure_playout(&self) {
        if self.playout_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let stopped = self.stopped.clone();
        let cancel = self.cancel.clone();
        let mixer = self.mixer.clone();
        tokio::spawn(async move {
            if let Err(err) = run_playout(stopped, cancel, mixer).await {
                warn!(%err, "audio playout unavailable");
            }
        });
    }
}

impl CpalAudioAdapter {
    async fn try_start_capture(&self) -> Result<(), AudioError> {
        // Ring sized for ~200 ms of mono audio at a generous rate.
        let ring = HeapRb::<f32>::new(19_200);
        let (producer, consumer) = ring.split();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let stopped = self.stopped.clone();
        std::thread::spawn(move || run_input_device(producer, ready_tx, stopped));

        let device_rate = tokio::task::spawn_blocking(move || {
            ready_rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| AudioError::mic_open_failed("input device did not start"))?
        })
        .await
        .map_err(|e| AudioError::other(e.to_string()))??;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "voicesync-mic".to_owned(),
        ));
        *self.track.lock().unwrap() = Some(track.clone());

        let encoder = OpusEncoder::new(OpusSampleRate::Hz48000, Channels::Mono, Application::Voip)
            .map_err(|e| AudioError::other(e.to_string()))?;
        let worker = CaptureWorker {
            consumer,
            encoder,
            device_rate,
            device_frame_samples: device_rate as usize / 50,
        };
        let muted = self.muted.clone();
        let cancel = self.cancel.clone();
        let samples_tx = self.samples_tx.clone();
        tokio::spawn(run_capture_frames(worker, track, muted, cancel, samples_tx));

        Ok(())
    }
}

#[async_trait]
impl AudioAdapter for CpalAudioAdapter {
    async fn start_capture(&self) -> Result<(), AudioError> {
        if self.capture_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.try_start_capture().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.capture_running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn local_track(&self) -> Option<LocalAudioTrack> {
        self.track.lock().unwrap().clone()
    }

    fn subscribe_samples(&self) -> broadcast::Receiver<SampleBatch> {
        self.samples_tx.subscribe()
    }

    async fn add_remote(&self, peer_id: PeerId, track: RemoteAudioTrack) {
        self.ensure_playout();

        let cancel = self.cancel.child_token();
        if let Some(old) = self
            .remotes
            .lock()
            .unwrap()
            .insert(peer_id.clone(), cancel.clone())
        {
            old.cancel();
        }

        info!(%peer_id, "remote audio stream attached");
        let mixer = self.mixer.clone();
        tokio::spawn(run_remote_reader(peer_id, track, mixer, cancel));
    }

    async fn remove_remote(&self, peer_id: &PeerId) {
        if let Some(cancel) = self.remotes.lock().unwrap().remove(peer_id) {
            cancel.cancel();
        }
        self.mixer.lock().unwrap().remove(peer_id);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.stopped.store(true, Ordering::SeqCst);
        self.remotes.lock().unwrap().clear();
        self.mixer.lock().unwrap().clear();
        *self.track.lock().unwrap() = None;
    }
}

// ---------------------------------------------------------------------------
// Capture path
// ---------------------------------------------------------------------------

/// Opens the default input device and feeds mono samples into the ring.
///
/// Runs on its own OS thread because the cpal stream must stay alive (and is
/// not `Send`); the thread parks until the adapter stops.
fn run_input_device(
    mut producer: ringbuf::HeapProd<f32>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, AudioError>>,
    stopped: Arc<AtomicBool>,
) {
    let opened = (|| {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::mic_open_failed("no default input device"))?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::mic_open_failed(e.to_string()))?;
        let channels = supported.channels() as usize;
        let rate = supported.sample_rate().0;
        info!(
            device = device.name().unwrap_or_default(),
            channels, rate, "opening audio input device"
        );

        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if channels == 1 {
                        let _ = producer.push_slice(data);
                    } else {
                        for frame in data.chunks_exact(channels) {
                            let mono: f32 = frame.iter().sum::<f32>() / channels as f32;
                            let _ = producer.try_push(mono);
                        }
                    }
                },
                |err| warn!(%err, "audio input stream error"),
                None,
            )
            .map_err(|e| AudioError::mic_open_failed(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::mic_stream_error(e.to_string()))?;
        Ok((stream, rate))
    })();

    match opened {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            while !stopped.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
        }
    }
}

struct CaptureWorker {
    consumer: ringbuf::HeapCons<f32>,
    encoder: OpusEncoder,
    device_rate: u32,
    device_frame_samples: usize,
}

// SAFETY: the worker is moved into exactly one tokio task and only ever
// touched there; the Opus encoder is never shared across threads.
unsafe impl Send for CaptureWorker {}

/// 20 ms frame loop: broadcast raw samples, Opus-encode into the track.
async fn run_capture_frames(
    mut worker: CaptureWorker,
    track: LocalAudioTrack,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    samples_tx: broadcast::Sender<SampleBatch>,
) {
    let mut device_pcm = vec![0.0f32; worker.device_frame_samples];
    let mut opus_buf = vec![0u8; 1500];

    loop {
        if cancel.is_cancelled() {
            debug!("capture frame loop stopped");
            return;
        }
        if worker.consumer.occupied_len() < worker.device_frame_samples {
            tokio::time::sleep(Duration::from_millis(2)).await;
            continue;
        }
        worker.consumer.pop_slice(&mut device_pcm);

        if muted.load(Ordering::SeqCst) {
            device_pcm.fill(0.0);
        }

        let pcm_48k = if worker.device_rate == OPUS_SAMPLE_RATE {
            device_pcm.clone()
        } else {
            resample(&device_pcm, worker.device_rate, OPUS_SAMPLE_RATE)
        };

        let _ = samples_tx.send(Arc::new(pcm_48k.clone()));

        let pcm_i16: Vec<i16> = pcm_48k
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        match worker.encoder.encode(&pcm_i16, &mut opus_buf) {
            Ok(len) => {
                let sample = Sample {
                    data: Bytes::copy_from_slice(&opus_buf[..len]),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(err) = track.write_sample(&sample).await {
                    trace!(%err, "dropping encoded frame");
                }
            }
            Err(err) => warn!(%err, "opus encode failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Playout path
// ---------------------------------------------------------------------------

struct RemoteDecoder {
    decoder: OpusDecoder,
}

// SAFETY: lives inside exactly one reader task; never shared.
unsafe impl Send for RemoteDecoder {}

/// Reads one remote track: depacketize, decode, queue for the mixer.
async fn run_remote_reader(
    peer_id: PeerId,
    track: RemoteAudioTrack,
    mixer: MixerBuffers,
    cancel: CancellationToken,
) {
    let mut remote = match OpusDecoder::new(OpusSampleRate::Hz48000, Channels::Mono) {
        Ok(decoder) => RemoteDecoder { decoder },
        Err(err) => {
            warn!(%peer_id, %err, "failed to create opus decoder");
            return;
        }
    };
    let mut pcm = vec![0i16; FRAME_SAMPLES];

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _)) => packet,
                Err(err) => {
                    debug!(%peer_id, %err, "remote track ended");
                    break;
                }
            },
        };
        if packet.payload.is_empty() {
            continue;
        }
        let decoded = match remote
            .decoder
            .decode(Some(&packet.payload[..]), &mut pcm[..], false)
        {
            Ok(n) => n,
            Err(err) => {
                warn!(%peer_id, %err, "opus decode failed");
                continue;
            }
        };
        let frame: Vec<f32> = pcm[..decoded]
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .collect();

        let mut buffers = mixer.lock().unwrap();
        let queue = buffers.entry(peer_id.clone()).or_default();
        if queue.len() >= MAX_REMOTE_FRAMES {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    mixer.lock().unwrap().remove(&peer_id);
}

/// Opens the output device and runs the 20 ms mixing loop.
async fn run_playout(
    stopped: Arc<AtomicBool>,
    cancel: CancellationToken,
    mixer: MixerBuffers,
) -> Result<(), AudioError> {
    // Ring sized for ~200 ms of mono audio at a generous rate.
    let ring = HeapRb::<f32>::new(19_200);
    let (mut producer, consumer) = ring.split();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let stopped_out = stopped.clone();
    std::thread::spawn(move || run_output_device(consumer, ready_tx, stopped_out));
    let device_rate = tokio::task::spawn_blocking(move || {
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| AudioError::other("output device did not start"))?
    })
    .await
    .map_err(|e| AudioError::other(e.to_string()))??;

    let mut mix = vec![0.0f32; FRAME_SAMPLES];
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("playout loop stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        mix.fill(0.0);
        let mut active = 0u32;
        {
            let mut buffers = mixer.lock().unwrap();
            for queue in buffers.values_mut() {
                if let Some(frame) = queue.pop_front() {
                    active += 1;
                    for (slot, sample) in mix.iter_mut().zip(frame.iter()) {
                        *slot += sample;
                    }
                }
            }
        }
        if active == 0 {
            continue;
        }
        for sample in mix.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        if device_rate == OPUS_SAMPLE_RATE {
            let _ = producer.push_slice(&mix);
        } else {
            let resampled = resample(&mix, OPUS_SAMPLE_RATE, device_rate);
            let _ = producer.push_slice(&resampled);
        }
    }
}

/// Owns the cpal output stream; the callback fans mono out to all channels.
fn run_output_device(
    mut consumer: ringbuf::HeapCons<f32>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, AudioError>>,
    stopped: Arc<AtomicBool>,
) {
    let opened = (|| {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::other("no default output device"))?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::other(e.to_string()))?;
        let channels = supported.channels() as usize;
        let rate = supported.sample_rate().0;
        info!(
            device = device.name().unwrap_or_default(),
            channels, rate, "opening audio output device"
        );

        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    data.fill(0.0);
                    if channels == 1 {
                        consumer.pop_slice(data);
                    } else {
                        for frame in data.chunks_exact_mut(channels) {
                            let sample = consumer.try_pop().unwrap_or(0.0);
                            frame.fill(sample);
                        }
                    }
                },
                |err| warn!(%err, "audio output stream error"),
                None,
            )
            .map_err(|e| AudioError::other(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::other(e.to_string()))?;
        Ok((stream, rate))
    })();

    match opened {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            while !stopped.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
            }
            drop(stream);
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
        }
    }
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Linear-interpolation resampler; plenty for 20 ms voice frames.
fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = input.get(idx).copied().unwrap_or(0.0);
        let b = input.get(idx + 1).copied().unwrap_or(a);
        output.push(a + (b - a) * frac);
    }
    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
