//! The playout engine.
//!
//! [`NetEq`] takes RTP audio packets in whatever order and timing they
//! arrive and hands out one 10 ms frame of PCM per call to
//! [`NetEq::get_audio`]. Every call locks the whole engine once, so packet
//! arrival and playout may run on different threads.
//!
//! Each tick:
//! 1. the decision logic picks an [`Operation`] from the packet buffer, the
//!    sync buffer and the delay manager's target level,
//! 2. packets are extracted and decoded if the operation needs audio,
//! 3. the operation writes into the algorithm buffer, which is appended to
//!    the sync buffer,
//! 4. one frame is read from the sync buffer into the caller's slice.

mod decision;
mod insert;
mod operations;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::audio_vector::AudioMultiVector;
use crate::codec::{AudioDecoder, DecoderDatabase, PayloadFormat};
use crate::config::{BackgroundNoiseMode, NetEqConfig, PlayoutMode};
use crate::decision_logic::{DecisionLogic, Mode, Operation};
use crate::delay_manager::DelayManager;
use crate::dsp::{
    BackgroundNoise, ComfortNoise, DtmfToneGenerator, Expand, Merge, PitchStretcher, PostDecodeVad, TimeStretcher,
};
use crate::dsp::normal::Normal;
use crate::dtmf::DtmfBuffer;
use crate::error::{NetEqError, Result};
use crate::packet::{Packet, RtpHeader};
use crate::packet_buffer::PacketBuffer;
use crate::statistics::{NetworkStatistics, StatisticsCalculator};
use crate::sync_buffer::SyncBuffer;
use crate::tick_timer::TickTimer;

/// Output frame length.
const OUTPUT_SIZE_MS: usize = 10;
/// Length of the sync buffer, history included.
const SYNC_BUFFER_MS: usize = 180;
/// Largest decoded frame per channel: 120 ms at 48 kHz.
const MAX_FRAME_SIZE: usize = 5760;

/// How the audio of the last frame was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Decoded audio, possibly time-stretched.
    Normal,
    /// Packet loss concealment.
    Plc,
    /// Concealment that has faded to background noise.
    PlcToCng,
    /// Comfort noise.
    Cng,
    /// Decoded audio the VAD classified as non-speech.
    VadPassive,
}

/// Description of one frame written by [`NetEq::get_audio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFrame {
    pub samples_per_channel: usize,
    pub channels: usize,
    pub sample_rate_hz: u32,
    pub output_type: OutputType,
    /// RTP timestamp of the first sample in the frame.
    pub timestamp: u32,
}

/// Adaptive jitter buffer and playout engine.
///
/// `NetEq` is `Send + Sync`; share it with an `Arc` between the network
/// receive path and the audio output path.
pub struct NetEq {
    state: Mutex<EngineState>,
}

impl NetEq {
    /// Create an engine with the pitch-based time stretcher.
    pub fn new(config: NetEqConfig) -> Result<Self> {
        let stretcher = Box::new(PitchStretcher::new(config.sample_rate_hz, 1));
        Self::with_time_stretcher(config, stretcher)
    }

    /// Create an engine with a caller-chosen time stretcher.
    pub fn with_time_stretcher(config: NetEqConfig, time_stretcher: Box<dyn TimeStretcher>) -> Result<Self> {
        config.validate()?;
        info!(
            "NetEq created: {} Hz, {} packets, playout {}",
            config.sample_rate_hz,
            config.max_packets_in_buffer,
            config.playout_mode.as_str()
        );
        Ok(Self {
            state: Mutex::new(EngineState::new(&config, time_stretcher)?),
        })
    }

    /// Insert one RTP packet.
    ///
    /// `receive_timestamp` is the local arrival time in RTP timestamp units.
    pub fn insert_packet(&self, header: RtpHeader, payload: &[u8], receive_timestamp: u32) -> Result<()> {
        let mut state = self.state.lock();
        let packet = Packet::new(header, payload.to_vec());
        let result = state.insert_packets(vec![packet], receive_timestamp);
        state.record(result)
    }

    /// Insert packets that arrived together, e.g. a primary payload and its
    /// redundant copies. The first packet's header drives the statistics.
    pub fn insert_packet_list(&self, packets: Vec<Packet>, receive_timestamp: u32) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.insert_packets(packets, receive_timestamp);
        state.record(result)
    }

    /// Insert a placeholder for a packet whose payload is not needed. It
    /// decodes to silence of the last frame length.
    pub fn insert_sync_packet(&self, header: RtpHeader, receive_timestamp: u32) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.insert_sync_packet(header, receive_timestamp);
        state.record(result)
    }

    /// Produce the next 10 ms of audio into `output`, interleaved.
    ///
    /// `output` must hold at least one frame for the current channel count.
    pub fn get_audio(&self, output: &mut [i16]) -> Result<AudioFrame> {
        let mut state = self.state.lock();
        let result = state.get_audio(output);
        state.record(result)
    }

    pub fn register_payload_type(&self, payload_type: u8, format: PayloadFormat) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.decoder_database.register(payload_type, format);
        state.record(result)
    }

    pub fn register_external_decoder(&self, payload_type: u8, decoder: Box<dyn AudioDecoder>) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.decoder_database.register_external(payload_type, decoder);
        state.record(result)
    }

    /// Unregister a payload type and drop its buffered packets.
    pub fn remove_payload_type(&self, payload_type: u8) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.remove_payload_type(payload_type);
        state.record(result)
    }

    pub fn set_minimum_delay(&self, delay_ms: i32) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.delay_manager.set_minimum_delay(delay_ms);
        state.record(result)
    }

    pub fn set_maximum_delay(&self, delay_ms: i32) -> Result<()> {
        let mut state = self.state.lock();
        let result = state.delay_manager.set_maximum_delay(delay_ms);
        state.record(result)
    }

    /// Delay the jitter statistics alone would ask for, ignoring the
    /// configured minimum.
    pub fn least_required_delay_ms(&self) -> i32 {
        self.state.lock().delay_manager.least_required_delay_ms()
    }

    pub fn set_playout_mode(&self, mode: PlayoutMode) {
        let mut state = self.state.lock();
        if state.decision_logic.playout_mode() != mode {
            info!("Playout mode {}", mode.as_str());
        }
        state.decision_logic.set_playout_mode(mode);
        state.delay_manager.set_streaming_mode(mode == PlayoutMode::Streaming);
    }

    pub fn playout_mode(&self) -> PlayoutMode {
        self.state.lock().decision_logic.playout_mode()
    }

    pub fn set_background_noise_mode(&self, mode: BackgroundNoiseMode) {
        self.state.lock().background_noise.set_mode(mode);
    }

    pub fn background_noise_mode(&self) -> BackgroundNoiseMode {
        self.state.lock().background_noise.mode()
    }

    pub fn enable_vad(&self) {
        self.state.lock().vad.enable();
    }

    pub fn disable_vad(&self) {
        self.state.lock().vad.disable();
    }

    /// Statistics since the previous call. Starts a new report period.
    pub fn network_statistics(&self) -> NetworkStatistics {
        self.state.lock().network_statistics()
    }

    /// Waiting times of the most recently played packets, in ms.
    pub fn waiting_times(&self) -> Vec<i32> {
        self.state.lock().stats.waiting_times()
    }

    /// How often each operation has run.
    pub fn operation_counts(&self) -> BTreeMap<Operation, u64> {
        self.state.lock().stats.operation_counts().clone()
    }

    /// Drop all buffered packets and audio. The next packet starts a new
    /// stream.
    pub fn flush_buffers(&self) {
        self.state.lock().flush_buffers();
    }

    /// Audio held in the packet and sync buffers.
    pub fn current_delay_ms(&self) -> i32 {
        self.state.lock().current_delay_ms()
    }

    /// Delay the engine is steering towards.
    pub fn target_delay_ms(&self) -> i32 {
        let state = self.state.lock();
        (state.delay_manager.target_level() * state.delay_manager.packet_len_ms()) >> 8
    }

    /// RTP timestamp of the next sample to be played.
    pub fn playout_timestamp(&self) -> u32 {
        self.state.lock().playout_timestamp
    }

    /// The last error any call ran into, including the non-fatal ones.
    pub fn last_error(&self) -> Option<NetEqError> {
        self.state.lock().last_error.clone()
    }

    /// Code of the last decoder failure, 0 if none.
    pub fn last_decoder_error(&self) -> i32 {
        self.state.lock().decoder_error_code
    }

    pub fn packet_buffer_len(&self) -> usize {
        self.state.lock().packet_buffer.len()
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.state.lock().fs_hz
    }

    pub fn channels(&self) -> usize {
        self.state.lock().sync_buffer.channels()
    }

    /// Samples per channel in one output frame.
    pub fn output_size_samples(&self) -> usize {
        self.state.lock().output_size_samples
    }
}

/// Everything behind the engine lock.
pub(crate) struct EngineState {
    tick_timer: Arc<TickTimer>,
    decoder_database: DecoderDatabase,
    packet_buffer: PacketBuffer,
    delay_manager: DelayManager,
    decision_logic: DecisionLogic,
    dtmf_buffer: DtmfBuffer,
    dtmf_tone_generator: DtmfToneGenerator,
    stats: StatisticsCalculator,

    sync_buffer: SyncBuffer,
    algorithm_buffer: AudioMultiVector,
    /// Interleaved decoder output for the current tick.
    decoded_buffer: Vec<i16>,
    expand: Expand,
    merge: Merge,
    normal: Normal,
    time_stretcher: Box<dyn TimeStretcher>,
    background_noise: BackgroundNoise,
    vad: PostDecodeVad,
    comfort_noise: ComfortNoise,
    /// Gain per channel carried from concealment into decoded audio.
    mute_factors: Vec<f32>,

    fs_hz: u32,
    fs_mult: usize,
    output_size_samples: usize,
    /// Samples per channel of the last decoded frame.
    decoder_frame_length: usize,
    last_mode: Mode,

    /// Timestamp of the packet being played, or of the sync buffer end.
    timestamp: u32,
    playout_timestamp: u32,
    ssrc: u32,
    first_packet: bool,
    /// A new stream or codec was seen; resync at the next decision.
    new_codec: bool,
    reset_decoder: bool,
    current_rtp_pt: Option<u8>,
    current_cng_pt: Option<u8>,

    last_error: Option<NetEqError>,
    decoder_error_code: i32,
}

impl EngineState {
    fn new(config: &NetEqConfig, time_stretcher: Box<dyn TimeStretcher>) -> Result<Self> {
        let fs_hz = config.sample_rate_hz;
        let output_size_samples = fs_hz as usize / 100;
        let mut delay_manager = DelayManager::new(config.max_packets_in_buffer);
        delay_manager.set_streaming_mode(config.playout_mode == PlayoutMode::Streaming);
        delay_manager.set_maximum_delay(config.max_delay_ms)?;
        delay_manager.set_minimum_delay(config.min_delay_ms)?;

        let mut state = Self {
            tick_timer: TickTimer::new(),
            decoder_database: DecoderDatabase::new(),
            packet_buffer: PacketBuffer::new(config.max_packets_in_buffer),
            delay_manager,
            decision_logic: DecisionLogic::new(fs_hz, output_size_samples, config.playout_mode),
            dtmf_buffer: DtmfBuffer::new(fs_hz),
            dtmf_tone_generator: DtmfToneGenerator::new(),
            stats: StatisticsCalculator::new(),
            sync_buffer: SyncBuffer::new(1, 0),
            algorithm_buffer: AudioMultiVector::new(1),
            decoded_buffer: Vec::new(),
            expand: Expand::new(fs_hz, 1),
            merge: Merge::new(fs_hz, 1),
            normal: Normal::new(fs_hz, 1),
            time_stretcher,
            background_noise: BackgroundNoise::new(1, config.background_noise_mode),
            vad: PostDecodeVad::new(config.enable_post_decode_vad),
            comfort_noise: ComfortNoise::new(),
            mute_factors: vec![1.0],
            fs_hz,
            fs_mult: 1,
            output_size_samples,
            decoder_frame_length: 3 * output_size_samples,
            last_mode: Mode::Normal,
            timestamp: 0,
            playout_timestamp: 0,
            ssrc: 0,
            first_packet: true,
            new_codec: false,
            reset_decoder: false,
            current_rtp_pt: None,
            current_cng_pt: None,
            last_error: None,
            decoder_error_code: 0,
        };
        state.set_sample_rate_and_channels(fs_hz, 1);
        Ok(state)
    }

    /// Keep `result` as the last error if it failed.
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.clone());
        }
        result
    }

    /// Rebuild everything that depends on the sample rate or channel count.
    fn set_sample_rate_and_channels(&mut self, fs_hz: u32, channels: usize) {
        debug!("Output reconfigured to {} Hz, {} channel(s)", fs_hz, channels);
        let channels = channels.max(1);
        self.fs_hz = fs_hz;
        self.fs_mult = (fs_hz / 8000).max(1) as usize;
        self.output_size_samples = OUTPUT_SIZE_MS * 8 * self.fs_mult;
        self.decoder_frame_length = 3 * self.output_size_samples;
        self.last_mode = Mode::Normal;
        self.mute_factors = vec![1.0; channels];

        self.vad.init();
        self.algorithm_buffer = AudioMultiVector::new(channels);
        self.sync_buffer = SyncBuffer::new(channels, SYNC_BUFFER_MS * 8 * self.fs_mult);
        let bgn_mode = self.background_noise.mode();
        self.background_noise = BackgroundNoise::new(channels, bgn_mode);
        self.expand = Expand::new(fs_hz, channels);
        // A few samples of zero lookahead for the first expand.
        self.sync_buffer
            .set_next_index(self.sync_buffer.next_index() - self.expand.overlap_length());
        self.normal = Normal::new(fs_hz, channels);
        self.merge = Merge::new(fs_hz, channels);
        self.time_stretcher.set_sample_rate_and_channels(fs_hz, channels);
        self.comfort_noise = ComfortNoise::new();
        self.decoded_buffer = vec![0; MAX_FRAME_SIZE * channels];

        self.decision_logic.set_sample_rate(fs_hz, self.output_size_samples);
        self.dtmf_buffer.set_sample_rate(fs_hz);
    }

    fn remove_payload_type(&mut self, payload_type: u8) -> Result<()> {
        self.decoder_database.remove(payload_type)?;
        let dropped = self.packet_buffer.discard_packets_with_payload_type(payload_type);
        if dropped > 0 {
            debug!("Dropped {} buffered packets of payload type {}", dropped, payload_type);
        }
        if self.current_rtp_pt == Some(payload_type) {
            self.current_rtp_pt = None;
        }
        if self.current_cng_pt == Some(payload_type) {
            self.current_cng_pt = None;
        }
        Ok(())
    }

    fn flush_buffers(&mut self) {
        info!("Flushing buffers");
        self.packet_buffer.flush();
        self.dtmf_buffer.flush();
        let channels = self.sync_buffer.channels();
        self.sync_buffer = SyncBuffer::new(channels, self.sync_buffer.size());
        self.sync_buffer
            .set_next_index(self.sync_buffer.next_index() - self.expand.overlap_length());
        self.first_packet = true;
    }

    /// Samples per channel in the packet buffer plus unplayed sync buffer
    /// audio.
    fn samples_in_buffers(&self) -> usize {
        self.packet_buffer
            .num_samples_in_buffer(&self.decoder_database, self.decoder_frame_length)
            + self.sync_buffer.future_length()
    }

    fn current_delay_ms(&self) -> i32 {
        (self.samples_in_buffers() * 1000 / self.fs_hz as usize) as i32
    }

    fn network_statistics(&mut self) -> NetworkStatistics {
        let samples = self.samples_in_buffers();
        self.stats.get_network_statistics(
            self.fs_hz,
            samples,
            self.decoder_frame_length,
            self.decision_logic.packet_length_samples(),
            &self.delay_manager,
        )
    }

    /// Classify the frame just produced.
    fn last_output_type(&self) -> OutputType {
        match self.last_mode {
            Mode::Rfc3389Cng | Mode::CodecInternalCng => OutputType::Cng,
            Mode::Expand if self.expand.mute_factor(0) == 0.0 => OutputType::PlcToCng,
            Mode::Expand => OutputType::Plc,
            _ if self.vad.running() && !self.vad.active_speech() => OutputType::VadPassive,
            _ => OutputType::Normal,
        }
    }

    /// Interleaved samples the next tick may write. A tick only switches
    /// decoders to the format of the next buffered packet.
    fn required_output_len(&self) -> usize {
        let current = self.output_size_samples * self.sync_buffer.channels();
        let next = self
            .packet_buffer
            .next_header()
            .filter(|header| self.decoder_database.is_speech(header.payload_type))
            .and_then(|header| self.decoder_database.info(header.payload_type))
            .map(|info| OUTPUT_SIZE_MS * info.sample_rate_hz as usize / 1000 * info.channels())
            .unwrap_or(0);
        current.max(next)
    }

    fn get_audio(&mut self, output: &mut [i16]) -> Result<AudioFrame> {
        let needed = self.required_output_len();
        if output.len() < needed {
            warn!("Output buffer too short: {} < {}", output.len(), needed);
            return Err(NetEqError::OutputBufferTooShort {
                needed,
                got: output.len(),
            });
        }
        self.tick_timer.increment();
        self.get_audio_internal(&mut output[..needed])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pcm::encode_l16;
    use crate::codec::{CodecError, SpeechType};

    const PT_L16: u8 = 96;
    const PT_CNG: u8 = 13;
    const PT_DTMF: u8 = 101;
    const FRAME: usize = 80;
    const PACKET_SAMPLES: usize = 160;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn engine_8k() -> NetEq {
        init_logger();
        let config = NetEqConfig {
            sample_rate_hz: 8000,
            ..Default::default()
        };
        let neteq = NetEq::new(config).unwrap();
        neteq
            .register_payload_type(
                PT_L16,
                PayloadFormat::L16 {
                    sample_rate_hz: 8000,
                    channels: 1,
                },
            )
            .unwrap();
        neteq
    }

    /// Deterministic noise, loud and aperiodic enough that no time-stretch
    /// ever finds a period to cut.
    struct Noise(u32);

    impl Noise {
        fn samples(&mut self, n: usize) -> Vec<i16> {
            (0..n)
                .map(|_| {
                    self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    ((self.0 >> 16) as i32 % 6001 - 3000) as i16
                })
                .collect()
        }
    }

    fn header(seq: u16, timestamp: u32) -> RtpHeader {
        RtpHeader {
            payload_type: PT_L16,
            sequence_number: seq,
            timestamp,
            ssrc: 0x1234,
            marker: false,
        }
    }

    fn insert(neteq: &NetEq, noise: &mut Noise, seq: u16) {
        let ts = seq as u32 * PACKET_SAMPLES as u32;
        let payload = encode_l16(&noise.samples(PACKET_SAMPLES));
        neteq.insert_packet(header(seq, ts), &payload, ts).unwrap();
    }

    fn pull(neteq: &NetEq) -> AudioFrame {
        let mut out = [0i16; FRAME];
        neteq.get_audio(&mut out).unwrap()
    }

    /// Feed `count` packets of 20 ms, pulling two frames after each arrival.
    /// `held` packets arrive late, together with the following packet;
    /// `dropped` packets never arrive.
    fn run_stream(neteq: &NetEq, count: u16, dropped: impl Fn(u16) -> bool, held: impl Fn(u16) -> bool) {
        let mut noise = Noise(7);
        let mut pending = None;
        for seq in 0..count {
            if dropped(seq) {
                noise.samples(PACKET_SAMPLES);
            } else if held(seq) {
                pending = Some(seq);
                noise.samples(PACKET_SAMPLES);
            } else {
                if let Some(late) = pending.take() {
                    insert(neteq, &mut Noise(late as u32), late);
                }
                insert(neteq, &mut noise, seq);
            }
            pull(neteq);
            pull(neteq);
        }
    }

    #[test]
    fn test_engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NetEq>();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NetEqConfig {
            sample_rate_hz: 11025,
            ..Default::default()
        };
        assert_eq!(NetEq::new(config).err(), Some(NetEqError::InvalidSampleRate(11025)));
    }

    #[test]
    fn test_silence_before_first_packet() {
        let neteq = engine_8k();
        let mut out = [1i16; FRAME];
        let frame = neteq.get_audio(&mut out).unwrap();
        assert_eq!(frame.samples_per_channel, FRAME);
        assert_eq!(frame.channels, 1);
        assert_eq!(frame.sample_rate_hz, 8000);
        assert_eq!(frame.output_type, OutputType::Plc);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_output_buffer_too_short() {
        let neteq = engine_8k();
        let mut out = [0i16; FRAME - 1];
        let err = neteq.get_audio(&mut out).unwrap_err();
        assert_eq!(err, NetEqError::OutputBufferTooShort { needed: FRAME, got: FRAME - 1 });
        assert_eq!(neteq.last_error(), Some(err));
    }

    #[test]
    fn test_clean_stream_converges_to_one_packet() {
        let neteq = engine_8k();
        run_stream(&neteq, 50, |_| false, |_| false);

        assert_eq!(neteq.target_delay_ms(), 20);
        let counts = neteq.operation_counts();
        assert_eq!(counts.get(&Operation::Expand), None);
        assert_eq!(counts.get(&Operation::Merge), None);

        let stats = neteq.network_statistics();
        assert_eq!(stats.preferred_buffer_size_ms, 20);
        assert_eq!(stats.packet_loss_rate, 0);
        assert_eq!(stats.expand_rate, 0);
        assert!(stats.mean_waiting_time_ms >= 0);
        assert!(neteq.last_error().is_none());
    }

    #[test]
    fn test_decoded_audio_reaches_output() {
        let neteq = engine_8k();
        let mut noise = Noise(1);
        let samples = noise.samples(PACKET_SAMPLES);
        neteq
            .insert_packet(header(0, 0), &encode_l16(&samples), 0)
            .unwrap();

        // The overlap lookahead delays the decoded audio by five samples.
        let mut first = [0i16; FRAME];
        let frame = neteq.get_audio(&mut first).unwrap();
        assert_eq!(frame.output_type, OutputType::Normal);
        assert_eq!(&first[5..], &samples[..FRAME - 5]);
        let mut second = [0i16; FRAME];
        neteq.get_audio(&mut second).unwrap();
        assert_eq!(&second[..], &samples[FRAME - 5..2 * FRAME - 5]);
    }

    #[test]
    fn test_lost_packets_are_concealed() {
        let clean = engine_8k();
        run_stream(&clean, 50, |_| false, |_| false);
        let clean_stats = clean.network_statistics();

        let lossy = engine_8k();
        run_stream(&lossy, 50, |seq| seq % 10 == 9, |_| false);
        assert!(lossy.operation_counts().get(&Operation::Expand).copied().unwrap_or(0) > 0);
        let lossy_stats = lossy.network_statistics();
        assert!(lossy_stats.expand_rate > 0);
        assert!(lossy_stats.packet_loss_rate > 0);
        // Sequence gaps are taken out of the inter-arrival time, so loss
        // alone does not add delay.
        assert_eq!(lossy_stats.preferred_buffer_size_ms, clean_stats.preferred_buffer_size_ms);
    }

    #[test]
    fn test_lossy_late_stream_raises_preferred_delay() {
        let clean = engine_8k();
        run_stream(&clean, 50, |_| false, |_| false);
        let clean_stats = clean.network_statistics();

        // Every 10th packet lost and every 5th one a packet late.
        let impaired = engine_8k();
        run_stream(&impaired, 50, |seq| seq % 10 == 9, |seq| seq % 5 == 2);
        assert!(impaired.operation_counts().get(&Operation::Expand).copied().unwrap_or(0) > 0);
        let impaired_stats = impaired.network_statistics();
        assert!(impaired_stats.packet_loss_rate > 0);
        assert!(
            impaired_stats.preferred_buffer_size_ms > clean_stats.preferred_buffer_size_ms,
            "impaired {} ms, clean {} ms",
            impaired_stats.preferred_buffer_size_ms,
            clean_stats.preferred_buffer_size_ms
        );
        assert!(impaired.target_delay_ms() > clean.target_delay_ms());
    }

    #[test]
    fn test_stale_packet_is_discarded() {
        let neteq = engine_8k();
        let mut noise = Noise(5);
        let mut last = 0;
        for seq in 0..400 {
            insert(&neteq, &mut noise, seq);
            pull(&neteq);
            last = pull(&neteq).timestamp;
        }
        assert_eq!(neteq.network_statistics().packet_loss_rate, 0);
        let counts = neteq.operation_counts();
        let expands = counts.get(&Operation::Expand).copied().unwrap_or(0);
        let merges = counts.get(&Operation::Merge).copied().unwrap_or(0);

        for seq in 400..410 {
            insert(&neteq, &mut noise, seq);
            if seq == 400 {
                // Six seconds behind the playout point.
                let stale_seq = seq - 300;
                let stale_ts = stale_seq as u32 * PACKET_SAMPLES as u32;
                let payload = encode_l16(&noise.samples(PACKET_SAMPLES));
                neteq
                    .insert_packet(header(stale_seq, stale_ts), &payload, 0)
                    .unwrap();
                assert_eq!(neteq.packet_buffer_len(), 2);
            }
            for _ in 0..2 {
                let frame = pull(&neteq);
                assert_eq!(frame.timestamp, last.wrapping_add(FRAME as u32));
                last = frame.timestamp;
            }
            assert_eq!(neteq.packet_buffer_len(), 0);
        }

        let stats = neteq.network_statistics();
        assert_eq!(stats.packet_loss_rate, 0);
        assert!(stats.packet_discard_rate > 0);
        let counts = neteq.operation_counts();
        assert_eq!(counts.get(&Operation::Expand).copied().unwrap_or(0), expands);
        assert_eq!(counts.get(&Operation::Merge).copied().unwrap_or(0), merges);
    }

    #[test]
    fn test_jitter_raises_target_delay() {
        let neteq = engine_8k();
        run_stream(&neteq, 50, |_| false, |seq| seq % 5 == 4);
        assert!(neteq.target_delay_ms() > 20);
        assert!(neteq.network_statistics().preferred_buffer_size_ms > 20);
    }

    #[test]
    fn test_frame_timestamps_advance() {
        let neteq = engine_8k();
        let mut noise = Noise(3);
        let mut last = None;
        for seq in 0..10u16 {
            insert(&neteq, &mut noise, seq);
            for _ in 0..2 {
                let frame = pull(&neteq);
                if let Some(prev) = last {
                    assert_eq!(frame.timestamp.wrapping_sub(prev), FRAME as u32);
                }
                last = Some(frame.timestamp);
            }
        }
        assert_eq!(neteq.playout_timestamp(), last.unwrap().wrapping_add(FRAME as u32));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "undefined decision"))]
    fn test_undefined_decision_is_recorded() {
        let neteq = engine_8k();
        let mut state = neteq.state.lock();
        state.report_undefined_decision();
        assert!(matches!(state.last_error, Some(NetEqError::InvalidOperation(_))));
    }

    #[test]
    fn test_packet_after_error_tick_resyncs() {
        let neteq = engine_8k();
        let mut noise = Noise(2);
        for seq in 0..5 {
            insert(&neteq, &mut noise, seq);
            pull(&neteq);
            pull(&neteq);
        }
        neteq.state.lock().last_mode = Mode::Error;
        insert(&neteq, &mut noise, 5);
        pull(&neteq);
        let frame = pull(&neteq);
        assert_eq!(frame.output_type, OutputType::Normal);
        assert_eq!(neteq.packet_buffer_len(), 0);
        assert!(neteq.last_error().is_none());
    }

    #[test]
    fn test_unknown_payload_type_leaves_state_unchanged() {
        let neteq = engine_8k();
        let mut bad = header(0, 0);
        bad.payload_type = 55;
        let err = neteq.insert_packet(bad, &[0; 320], 0).unwrap_err();
        assert_eq!(err, NetEqError::UnknownPayloadType(55));
        assert_eq!(neteq.packet_buffer_len(), 0);
        assert_eq!(neteq.last_error(), Some(err));

        // The first real packet is still treated as the start of the stream.
        insert(&neteq, &mut Noise(1), 0);
        assert_eq!(pull(&neteq).output_type, OutputType::Normal);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let neteq = engine_8k();
        let err = neteq.insert_packet(header(0, 0), &[], 0).unwrap_err();
        assert!(matches!(err, NetEqError::InvalidPacket(_)));
        assert_eq!(neteq.packet_buffer_len(), 0);
    }

    #[test]
    fn test_flush_buffers() {
        let neteq = engine_8k();
        let mut noise = Noise(1);
        for seq in 0..5 {
            insert(&neteq, &mut noise, seq);
        }
        assert_eq!(neteq.packet_buffer_len(), 5);
        assert!(neteq.current_delay_ms() >= 100);
        neteq.flush_buffers();
        assert_eq!(neteq.packet_buffer_len(), 0);
        assert_eq!(neteq.current_delay_ms(), 0);

        // A new stream starts cleanly after the flush.
        insert(&neteq, &mut noise, 100);
        assert_eq!(pull(&neteq).output_type, OutputType::Normal);
    }

    #[test]
    fn test_new_ssrc_flushes() {
        let neteq = engine_8k();
        let mut noise = Noise(1);
        for seq in 0..3 {
            insert(&neteq, &mut noise, seq);
        }
        let mut other = header(500, 90_000);
        other.ssrc = 0x9999;
        let payload = encode_l16(&noise.samples(PACKET_SAMPLES));
        neteq.insert_packet(other, &payload, 0).unwrap();
        assert_eq!(neteq.packet_buffer_len(), 1);
        pull(&neteq);
        assert_eq!(neteq.playout_timestamp(), 90_000 + FRAME as u32 - 5);
    }

    #[test]
    fn test_buffer_overflow_flushes() {
        init_logger();
        let config = NetEqConfig {
            sample_rate_hz: 8000,
            max_packets_in_buffer: 4,
            ..Default::default()
        };
        let neteq = NetEq::new(config).unwrap();
        neteq
            .register_payload_type(
                PT_L16,
                PayloadFormat::L16 {
                    sample_rate_hz: 8000,
                    channels: 1,
                },
            )
            .unwrap();
        let mut noise = Noise(1);
        for seq in 0..5 {
            insert(&neteq, &mut noise, seq);
        }
        assert_eq!(neteq.packet_buffer_len(), 1);
        assert!(neteq.last_error().is_none());
        assert_eq!(pull(&neteq).output_type, OutputType::Normal);
    }

    #[test]
    fn test_sync_packets() {
        let neteq = engine_8k();

        // Not accepted before the stream has started.
        let err = neteq.insert_sync_packet(header(0, 0), 0).unwrap_err();
        assert!(matches!(err, NetEqError::InvalidPacket(_)));

        let mut noise = Noise(1);
        insert(&neteq, &mut noise, 0);
        pull(&neteq);
        pull(&neteq);
        neteq.insert_sync_packet(header(1, 160), 160).unwrap();

        let mut other_ssrc = header(2, 320);
        other_ssrc.ssrc = 1;
        assert!(neteq.insert_sync_packet(other_ssrc, 320).is_err());

        // Plays as silence of the last frame length.
        let mut out = [1i16; FRAME];
        neteq.get_audio(&mut out).unwrap();
        assert!(out[5..].iter().all(|&s| s == 0));
        neteq.get_audio(&mut out).unwrap();
        assert!(out.iter().take(FRAME - 5).all(|&s| s == 0));
    }

    struct FailingDecoder;

    impl AudioDecoder for FailingDecoder {
        fn decode(&mut self, _payload: &[u8], _output: &mut [i16]) -> std::result::Result<(usize, SpeechType), CodecError> {
            Err(CodecError::DecoderCode(42))
        }

        fn packet_duration(&self, _payload: &[u8]) -> Option<usize> {
            Some(PACKET_SAMPLES)
        }

        fn sample_rate(&self) -> u32 {
            8000
        }

        fn channels(&self) -> usize {
            1
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_decoder_error_is_concealed() {
        let neteq = engine_8k();
        neteq.register_external_decoder(120, Box::new(FailingDecoder)).unwrap();
        let mut h = header(0, 0);
        h.payload_type = 120;
        neteq.insert_packet(h, &[1, 2, 3, 4], 0).unwrap();

        let frame = pull(&neteq);
        assert_eq!(frame.output_type, OutputType::Plc);
        assert_eq!(neteq.last_decoder_error(), 42);
        assert_eq!(
            neteq.last_error(),
            Some(NetEqError::Decoder(CodecError::DecoderCode(42)))
        );
    }

    /// Reports more samples than the output buffer holds.
    struct OverreportingDecoder;

    impl AudioDecoder for OverreportingDecoder {
        fn decode(&mut self, _payload: &[u8], output: &mut [i16]) -> std::result::Result<(usize, SpeechType), CodecError> {
            Ok((output.len() + 1, SpeechType::Speech))
        }

        fn packet_duration(&self, _payload: &[u8]) -> Option<usize> {
            Some(PACKET_SAMPLES)
        }

        fn sample_rate(&self) -> u32 {
            8000
        }

        fn channels(&self) -> usize {
            1
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_decoder_length_past_buffer_is_concealed() {
        let neteq = engine_8k();
        neteq
            .register_external_decoder(121, Box::new(OverreportingDecoder))
            .unwrap();
        let mut h = header(0, 0);
        h.payload_type = 121;
        neteq.insert_packet(h, &[1, 2, 3, 4], 0).unwrap();

        let frame = pull(&neteq);
        assert_eq!(frame.output_type, OutputType::Plc);
        assert_eq!(neteq.last_decoder_error(), CodecError::BufferTooSmall.code());
        assert_eq!(
            neteq.last_error(),
            Some(NetEqError::Decoder(CodecError::BufferTooSmall))
        );
    }

    #[test]
    fn test_comfort_noise() {
        let neteq = engine_8k();
        neteq
            .register_payload_type(PT_CNG, PayloadFormat::ComfortNoise { sample_rate_hz: 8000 })
            .unwrap();
        let mut noise = Noise(1);
        insert(&neteq, &mut noise, 0);
        pull(&neteq);
        pull(&neteq);

        let mut sid = header(1, 160);
        sid.payload_type = PT_CNG;
        neteq.insert_packet(sid, &[40], 160).unwrap();

        let mut saw_cng = false;
        for _ in 0..10 {
            let mut out = [0i16; FRAME];
            let frame = neteq.get_audio(&mut out).unwrap();
            if frame.output_type == OutputType::Cng {
                saw_cng = true;
                assert!(out.iter().any(|&s| s != 0));
            }
        }
        assert!(saw_cng);
        let counts = neteq.operation_counts();
        assert_eq!(counts.get(&Operation::Rfc3389Cng), Some(&1));
        assert!(counts.get(&Operation::Rfc3389CngNoPacket).copied().unwrap_or(0) > 0);
        assert_eq!(counts.get(&Operation::Expand), None);

        // Speech resumes after the noise.
        let resume_ts = 160 + 20 * FRAME as u32;
        let payload = encode_l16(&noise.samples(PACKET_SAMPLES));
        neteq.insert_packet(header(2, resume_ts), &payload, resume_ts).unwrap();
        let mut resumed = false;
        for _ in 0..30 {
            if pull(&neteq).output_type == OutputType::Normal {
                resumed = true;
                break;
            }
        }
        assert!(resumed);
    }

    #[test]
    fn test_dtmf_event_plays_tone() {
        let neteq = engine_8k();
        neteq
            .register_payload_type(PT_DTMF, PayloadFormat::Dtmf { sample_rate_hz: 8000 })
            .unwrap();
        let mut noise = Noise(1);
        insert(&neteq, &mut noise, 0);
        pull(&neteq);
        pull(&neteq);

        // Digit 5, -10 dBm0, 400 samples, ended.
        let mut event = header(1, 160);
        event.payload_type = PT_DTMF;
        neteq.insert_packet(event, &[5, 0x80 | 10, 0x01, 0x90], 160).unwrap();
        assert_eq!(neteq.packet_buffer_len(), 0);

        let mut loud = false;
        for _ in 0..4 {
            let mut out = [0i16; FRAME];
            neteq.get_audio(&mut out).unwrap();
            loud |= out.iter().any(|&s| s.unsigned_abs() > 1000);
        }
        assert!(loud);
        assert!(neteq.operation_counts().get(&Operation::Dtmf).copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_invalid_dtmf_payload() {
        let neteq = engine_8k();
        neteq
            .register_payload_type(PT_DTMF, PayloadFormat::Dtmf { sample_rate_hz: 8000 })
            .unwrap();
        let mut event = header(0, 0);
        event.payload_type = PT_DTMF;
        let err = neteq.insert_packet(event, &[5, 10], 0).unwrap_err();
        assert!(matches!(err, NetEqError::InvalidDtmfEvent(_)));
    }

    #[test]
    fn test_off_mode_inserts_zeros() {
        let neteq = engine_8k();
        neteq.set_playout_mode(PlayoutMode::Off);
        assert_eq!(neteq.playout_mode(), PlayoutMode::Off);
        run_stream(&neteq, 20, |seq| seq == 10, |_| false);
        let counts = neteq.operation_counts();
        assert!(counts.get(&Operation::AlternativePlc).copied().unwrap_or(0) > 0);
        assert_eq!(counts.get(&Operation::Expand), None);
        assert_eq!(counts.get(&Operation::Accelerate), None);
        assert_eq!(counts.get(&Operation::PreemptiveExpand), None);
        assert!(neteq.network_statistics().added_zero_samples > 0);
    }

    #[test]
    fn test_fax_mode_repeats_audio() {
        let neteq = engine_8k();
        neteq.set_playout_mode(PlayoutMode::Fax);
        run_stream(&neteq, 20, |seq| seq == 10, |_| false);
        let counts = neteq.operation_counts();
        assert!(counts.get(&Operation::AudioRepetition).copied().unwrap_or(0) > 0);
        assert_eq!(counts.get(&Operation::Expand), None);
    }

    #[test]
    fn test_delay_bounds() {
        let neteq = engine_8k();
        neteq.set_maximum_delay(200).unwrap();
        assert!(neteq.set_minimum_delay(300).is_err());
        neteq.set_minimum_delay(100).unwrap();
        assert!(neteq.set_maximum_delay(50).is_err());
        assert!(matches!(neteq.last_error(), Some(NetEqError::InvalidDelay(50))));
    }

    #[test]
    fn test_remove_payload_type_drops_packets() {
        let neteq = engine_8k();
        let mut noise = Noise(1);
        insert(&neteq, &mut noise, 0);
        insert(&neteq, &mut noise, 1);
        neteq.remove_payload_type(PT_L16).unwrap();
        assert_eq!(neteq.packet_buffer_len(), 0);
        assert_eq!(neteq.remove_payload_type(PT_L16), Err(NetEqError::UnknownPayloadType(PT_L16)));
    }

    #[test]
    fn test_sample_rate_follows_decoder() {
        let neteq = engine_8k();
        neteq
            .register_payload_type(
                97,
                PayloadFormat::L16 {
                    sample_rate_hz: 16000,
                    channels: 2,
                },
            )
            .unwrap();
        let mut h = header(0, 0);
        h.payload_type = 97;
        let samples = Noise(1).samples(320 * 2);
        neteq.insert_packet(h, &encode_l16(&samples), 0).unwrap();
        assert_eq!(neteq.sample_rate_hz(), 16000);
        assert_eq!(neteq.channels(), 2);
        assert_eq!(neteq.output_size_samples(), 160);

        let mut out = [0i16; 320];
        let frame = neteq.get_audio(&mut out).unwrap();
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.samples_per_channel, 160);
        assert_eq!(frame.sample_rate_hz, 16000);
    }

    #[test]
    fn test_short_output_checked_before_decoder_switch() {
        let neteq = engine_8k();
        neteq
            .register_payload_type(
                97,
                PayloadFormat::L16 {
                    sample_rate_hz: 16000,
                    channels: 2,
                },
            )
            .unwrap();
        let mut h = header(0, 0);
        h.payload_type = 97;
        let samples = Noise(1).samples(320 * 2);
        neteq.insert_packet(h, &encode_l16(&samples), 0).unwrap();
        // Output still at the old format while a stereo packet waits.
        neteq.state.lock().set_sample_rate_and_channels(8000, 1);
        let ticks = neteq.state.lock().tick_timer.ticks();

        let mut out = [0i16; FRAME];
        let err = neteq.get_audio(&mut out).unwrap_err();
        assert_eq!(err, NetEqError::OutputBufferTooShort { needed: 320, got: FRAME });
        assert_eq!(neteq.packet_buffer_len(), 1);
        assert_eq!(neteq.sample_rate_hz(), 8000);
        assert_eq!(neteq.channels(), 1);
        assert_eq!(neteq.state.lock().tick_timer.ticks(), ticks);

        let mut out = [0i16; 320];
        let frame = neteq.get_audio(&mut out).unwrap();
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.sample_rate_hz, 16000);
        assert_eq!(neteq.packet_buffer_len(), 0);
    }

    #[test]
    fn test_redundant_packets_fill_gaps() {
        let neteq = engine_8k();
        let mut noise = Noise(1);
        insert(&neteq, &mut noise, 0);
        let primary = Packet::new(header(2, 320), encode_l16(&noise.samples(PACKET_SAMPLES)));
        let redundant = Packet::redundant(header(1, 160), encode_l16(&noise.samples(PACKET_SAMPLES)));
        neteq.insert_packet_list(vec![primary, redundant], 320).unwrap();
        assert_eq!(neteq.packet_buffer_len(), 3);
        for _ in 0..6 {
            pull(&neteq);
        }
        assert_eq!(neteq.operation_counts().get(&Operation::Expand), None);
    }

    #[test]
    fn test_statistics_json() {
        let neteq = engine_8k();
        run_stream(&neteq, 10, |_| false, |_| false);
        let json = neteq.network_statistics().to_json().unwrap();
        assert!(json.contains("\"preferred_buffer_size_ms\""));
        assert!(!neteq.waiting_times().is_empty());
    }

    #[test]
    fn test_vad_toggle() {
        let neteq = engine_8k();
        neteq.disable_vad();
        insert(&neteq, &mut Noise(1), 0);
        assert_eq!(pull(&neteq).output_type, OutputType::Normal);
        neteq.enable_vad();
        neteq.set_background_noise_mode(BackgroundNoiseMode::Fade);
        assert_eq!(neteq.background_noise_mode(), BackgroundNoiseMode::Fade);
    }
}
