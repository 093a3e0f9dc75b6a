//! Decoding and the per-operation DSP handlers.

use log::{debug, error, trace, warn};

use crate::audio_vector::AudioMultiVector;
use crate::codec::{CodecError, SpeechType};
use crate::decision_logic::{Mode, Operation};
use crate::dsp::StretchResult;
use crate::dtmf::DtmfEvent;
use crate::error::{NetEqError, Result};
use crate::packet::{is_newer_timestamp, Packet};

use super::{AudioFrame, EngineState};

impl EngineState {
    /// One tick: decide, decode, run the operation and read one frame.
    pub(super) fn get_audio_internal(&mut self, output: &mut [i16]) -> Result<AudioFrame> {
        let mut plan = match self.get_decision() {
            Ok(plan) => plan,
            Err(e) => {
                self.last_mode = Mode::Error;
                return Err(e);
            }
        };

        let (decoded_len, speech_type) = self.decode(&mut plan.packets, &mut plan.operation);
        let channels = self.sync_buffer.channels();
        let sid_frame = plan.operation == Operation::Rfc3389Cng && !plan.packets.is_empty();
        self.vad
            .update(&self.decoded_buffer[..decoded_len], speech_type, sid_frame);
        self.stats.count_operation(plan.operation);
        trace!("Operation {} with {} decoded samples", plan.operation, decoded_len);

        let mut decoded = AudioMultiVector::new(channels);
        decoded.push_back_interleaved(&self.decoded_buffer[..decoded_len]);
        self.algorithm_buffer.clear();

        let play_dtmf = plan.play_dtmf;
        let result = match plan.operation {
            Operation::Normal => {
                self.do_normal(&decoded, speech_type, play_dtmf);
                Ok(())
            }
            Operation::Merge => {
                self.do_merge(&decoded, speech_type, play_dtmf);
                Ok(())
            }
            Operation::Expand => {
                self.do_expand(play_dtmf);
                Ok(())
            }
            Operation::Accelerate | Operation::FastAccelerate => {
                let interleaved = self.decoded_buffer[..decoded_len].to_vec();
                let fast = plan.operation == Operation::FastAccelerate;
                self.do_accelerate(&interleaved, speech_type, play_dtmf, fast);
                Ok(())
            }
            Operation::PreemptiveExpand => {
                let interleaved = self.decoded_buffer[..decoded_len].to_vec();
                self.do_preemptive_expand(&interleaved, speech_type, play_dtmf);
                Ok(())
            }
            Operation::Rfc3389Cng | Operation::Rfc3389CngNoPacket => self.do_rfc3389_cng(&plan.packets, play_dtmf),
            Operation::CodecInternalCng => {
                self.do_codec_internal_cng();
                Ok(())
            }
            Operation::Dtmf => match plan.dtmf_event {
                Some(event) => {
                    plan.play_dtmf = false;
                    self.do_dtmf(event)
                }
                None => Err(NetEqError::InvalidOperation("DTMF operation without an event")),
            },
            Operation::AlternativePlc => {
                self.do_alternative_plc(false);
                Ok(())
            }
            Operation::AlternativePlcIncreaseTimestamp => {
                self.do_alternative_plc(true);
                Ok(())
            }
            Operation::AudioRepetitionIncreaseTimestamp => {
                self.sync_buffer
                    .increase_end_timestamp(self.output_size_samples as u32);
                self.do_audio_repetition();
                Ok(())
            }
            Operation::AudioRepetition => {
                self.do_audio_repetition();
                Ok(())
            }
            Operation::Undefined => {
                error!("Undefined operation reached playout");
                Err(NetEqError::InvalidOperation("undefined operation"))
            }
        };
        if let Err(e) = result {
            self.last_mode = Mode::Error;
            return Err(e);
        }

        if self.last_mode != Mode::Rfc3389Cng {
            self.comfort_noise.reset();
        }

        self.sync_buffer.push_back(&self.algorithm_buffer);
        self.algorithm_buffer.clear();

        let out = self.output_size_samples;
        let needed = out * channels;
        if output.len() < needed {
            // get_audio sized the output for a switch to the next packet's format.
            return Err(NetEqError::OutputBufferTooShort {
                needed,
                got: output.len(),
            });
        }
        let output = &mut output[..needed];
        let read = self.sync_buffer.get_next_audio_interleaved(out, output);
        if read < out {
            warn!("Sync buffer underrun: {} of {} samples", read, out);
            output[read * channels..].fill(0);
            return Err(NetEqError::SampleUnderrun);
        }

        if plan.play_dtmf {
            if let Some(event) = plan.dtmf_event {
                if let Err(e) = self.overdub_dtmf(event, output) {
                    warn!("DTMF overdub failed: {}", e);
                    self.last_error = Some(e);
                }
            }
        }

        if matches!(
            self.last_mode,
            Mode::Normal | Mode::AccelerateFail | Mode::PreemptiveExpandFail | Mode::Rfc3389Cng | Mode::CodecInternalCng
        ) {
            self.background_noise.update(&self.sync_buffer, &self.vad, out);
        }

        if plan.operation == Operation::Dtmf {
            // Audio before this index is tone, not to be overdubbed again.
            self.sync_buffer.set_dtmf_index(self.sync_buffer.size());
        }

        if self.last_mode != Mode::Expand {
            // The playout timestamp never moves backwards.
            let temp = self
                .sync_buffer
                .end_timestamp()
                .wrapping_sub(self.sync_buffer.future_length() as u32);
            if is_newer_timestamp(temp, self.playout_timestamp) {
                self.playout_timestamp = temp;
            }
        } else {
            // Concealment has no timestamps of its own.
            self.playout_timestamp = self.playout_timestamp.wrapping_add(out as u32);
        }

        Ok(AudioFrame {
            samples_per_channel: out,
            channels,
            sample_rate_hz: self.fs_hz,
            output_type: self.last_output_type(),
            timestamp: self.playout_timestamp.wrapping_sub(out as u32),
        })
    }

    /// Decode the extracted packets into the decoded buffer.
    ///
    /// Returns the total samples written, all channels, and the speech type
    /// of the last frame. A comfort noise packet stops decoding and stays in
    /// `packets` for the CNG handler. A decoder failure turns the tick into
    /// an expand.
    fn decode(&mut self, packets: &mut Vec<Packet>, operation: &mut Operation) -> (usize, SpeechType) {
        let mut speech_type = SpeechType::Speech;
        let Some(first) = packets.first() else {
            return (0, speech_type);
        };
        let payload_type = first.payload_type();

        if !self.decoder_database.is_comfort_noise(payload_type) {
            match self.decoder_database.set_active_decoder(payload_type) {
                Ok(true) => {
                    let format = self
                        .decoder_database
                        .info(payload_type)
                        .map(|info| (info.sample_rate_hz, info.channels()));
                    if let Some((fs_hz, channels)) = format {
                        if fs_hz != self.fs_hz || channels != self.sync_buffer.channels() {
                            self.set_sample_rate_and_channels(fs_hz, channels);
                        }
                    }
                    debug!("Active decoder is now payload type {}", payload_type);
                    self.sync_buffer.set_end_timestamp(self.timestamp);
                    self.playout_timestamp = self.timestamp;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot decode payload type {}: {}", payload_type, e);
                    self.last_error = Some(e);
                    packets.clear();
                    return (0, speech_type);
                }
            }
        }

        if self.reset_decoder {
            if let Some(active) = self.decoder_database.active_decoder() {
                if let Some(decoder) = self.decoder_database.decoder_mut(active) {
                    decoder.reset();
                }
            }
            self.comfort_noise.reset();
            self.reset_decoder = false;
        }

        let channels = self.sync_buffer.channels();
        let mut decoded_len = 0;
        let mut failure = None;
        while let Some(packet) = packets.first() {
            if self.decoder_database.is_comfort_noise(packet.payload_type()) {
                break;
            }
            let packet = packets.remove(0);
            let space = &mut self.decoded_buffer[decoded_len..];
            let space_len = space.len();
            let result = if packet.sync_packet {
                let n = (self.decoder_frame_length * channels).min(space.len());
                space[..n].fill(0);
                Ok((n, SpeechType::Speech))
            } else {
                match self.decoder_database.decoder_mut(packet.payload_type()) {
                    Some(decoder) if packet.primary => decoder.decode(&packet.payload, space),
                    Some(decoder) => decoder.decode_redundant(&packet.payload, space),
                    None => Err(CodecError::NotInitialized),
                }
            };
            // A length past the end of the buffer is a decoder error.
            let result = result.and_then(|(n, kind)| {
                if n > space_len {
                    Err(CodecError::BufferTooSmall)
                } else {
                    Ok((n, kind))
                }
            });
            match result {
                Ok((n, kind)) => {
                    speech_type = kind;
                    if n > 0 {
                        self.decoder_frame_length = n / channels;
                        decoded_len += n;
                    }
                    if decoded_len >= self.decoded_buffer.len() && !packets.is_empty() {
                        warn!("Decoded buffer full, dropping {} packets", packets.len());
                        packets.clear();
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!("Decoder error {}: {}", e.code(), e);
            packets.clear();
            self.sync_buffer
                .increase_end_timestamp(self.decoder_frame_length as u32);
            self.decoder_error_code = e.code();
            self.last_error = Some(NetEqError::Decoder(e));
            *operation = Operation::Expand;
            return (0, speech_type);
        }

        if speech_type != SpeechType::ComfortNoise {
            self.sync_buffer
                .increase_end_timestamp((decoded_len / channels) as u32);
        }
        (decoded_len, speech_type)
    }

    fn do_normal(&mut self, decoded: &AudioMultiVector, speech_type: SpeechType, play_dtmf: bool) {
        let after_expand = self.last_mode == Mode::Expand;
        self.normal.process(
            decoded,
            after_expand,
            &mut self.expand,
            &self.sync_buffer,
            &self.background_noise,
            &mut self.mute_factors,
            &mut self.algorithm_buffer,
        );
        if !decoded.is_empty() {
            if after_expand {
                self.expand.reset();
            }
            self.last_mode = Mode::Normal;
        }
        if speech_type == SpeechType::ComfortNoise
            || (self.last_mode == Mode::CodecInternalCng && decoded.is_empty())
        {
            self.last_mode = Mode::CodecInternalCng;
        }
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
    }

    fn do_merge(&mut self, decoded: &AudioMultiVector, speech_type: SpeechType, play_dtmf: bool) {
        if decoded.is_empty() {
            // Nothing to merge into; keep concealing.
            self.do_expand(play_dtmf);
            return;
        }
        self.merge.process(
            decoded,
            &mut self.expand,
            &self.sync_buffer,
            &self.background_noise,
            &mut self.mute_factors,
            &mut self.algorithm_buffer,
        );
        self.last_mode = if speech_type == SpeechType::ComfortNoise {
            Mode::CodecInternalCng
        } else {
            Mode::Merge
        };
        self.expand.reset();
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
    }

    /// Conceal until the sync buffer holds a full frame past the overlap.
    fn do_expand(&mut self, play_dtmf: bool) {
        while self
            .sync_buffer
            .future_length()
            .saturating_sub(self.expand.overlap_length())
            < self.output_size_samples
        {
            self.algorithm_buffer.clear();
            self.expand
                .process(&self.sync_buffer, &self.background_noise, &mut self.algorithm_buffer);
            let len = self.algorithm_buffer.size();
            if len == 0 {
                break;
            }
            if self.expand.mute_factor(0) == 0.0 {
                self.stats.expanded_noise_samples(len);
            } else {
                self.stats.expanded_voice_samples(len);
            }
            self.last_mode = Mode::Expand;
            self.sync_buffer.push_back(&self.algorithm_buffer);
            self.algorithm_buffer.clear();
        }
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
    }

    /// Time-stretch input of 30 ms: the decoded audio, preceded by samples
    /// borrowed from the end of the sync buffer if it falls short.
    ///
    /// Returns the interleaved input and the samples per channel borrowed.
    fn stretch_input(&self, decoded: &[i16]) -> (Vec<i16>, usize) {
        let channels = self.sync_buffer.channels();
        let required = 240 * self.fs_mult;
        let wanted = required.saturating_sub(decoded.len() / channels);
        let mut input = vec![0i16; wanted * channels];
        let borrowed = self.sync_buffer.read_interleaved_from_end(wanted, &mut input);
        input.truncate(borrowed * channels);
        input.extend_from_slice(decoded);
        (input, borrowed)
    }

    fn do_accelerate(&mut self, decoded: &[i16], speech_type: SpeechType, play_dtmf: bool, fast_mode: bool) {
        let (input, borrowed) = self.stretch_input(decoded);
        let (result, removed) = self
            .time_stretcher
            .accelerate(&input, fast_mode, &mut self.algorithm_buffer);
        self.stats.accelerated_samples(removed);
        self.last_mode = match result {
            StretchResult::Success => Mode::AccelerateSuccess,
            StretchResult::SuccessLowEnergy => Mode::AccelerateLowEnergy,
            StretchResult::NoStretch => Mode::AccelerateFail,
        };

        if borrowed > 0 {
            // Hand the borrowed samples back to the sync buffer.
            let length = self.algorithm_buffer.size();
            let position = self.sync_buffer.size() - borrowed;
            if length < borrowed {
                self.sync_buffer
                    .replace_at_index(&self.algorithm_buffer, length, position);
                self.sync_buffer.push_front_zeros(borrowed - length);
                self.algorithm_buffer.pop_front(length);
            } else {
                self.sync_buffer
                    .replace_at_index(&self.algorithm_buffer, borrowed, position);
                self.algorithm_buffer.pop_front(borrowed);
            }
        }

        if speech_type == SpeechType::ComfortNoise {
            self.last_mode = Mode::CodecInternalCng;
        }
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
        self.expand.reset();
    }

    fn do_preemptive_expand(&mut self, decoded: &[i16], speech_type: SpeechType, play_dtmf: bool) {
        let (input, borrowed) = self.stretch_input(decoded);
        // Borrowed samples that have already been played.
        let old_borrowed = borrowed.saturating_sub(self.sync_buffer.future_length());
        let (result, added) = self
            .time_stretcher
            .preemptive_expand(&input, old_borrowed, &mut self.algorithm_buffer);
        self.stats.preemptive_expanded_samples(added);
        self.last_mode = match result {
            StretchResult::Success => Mode::PreemptiveExpandSuccess,
            StretchResult::SuccessLowEnergy => Mode::PreemptiveExpandLowEnergy,
            StretchResult::NoStretch => Mode::PreemptiveExpandFail,
        };

        if borrowed > 0 {
            let position = self.sync_buffer.size() - borrowed;
            self.sync_buffer
                .replace_at_index(&self.algorithm_buffer, borrowed, position);
            self.algorithm_buffer.pop_front(borrowed);
        }

        if speech_type == SpeechType::ComfortNoise {
            self.last_mode = Mode::CodecInternalCng;
        }
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
        self.expand.reset();
    }

    /// Play comfort noise, taking new parameters from a SID packet if one
    /// was extracted.
    fn do_rfc3389_cng(&mut self, packets: &[Packet], play_dtmf: bool) -> Result<()> {
        let out = self.output_size_samples;
        if let Some(packet) = packets.first() {
            let payload_type = packet.payload_type();
            if !self.decoder_database.is_comfort_noise(payload_type) {
                error!("Comfort noise operation with payload type {}", payload_type);
                return Err(NetEqError::InvalidOperation("comfort noise from a speech packet"));
            }
            let updated = self
                .decoder_database
                .set_active_cng(payload_type)
                .and_then(|_| self.comfort_noise.update_parameters(&packet.payload));
            if let Err(e) = updated {
                self.algorithm_buffer.zeros(out);
                return Err(e);
            }
        }
        if let Err(e) = self.comfort_noise.generate(out, &mut self.algorithm_buffer) {
            warn!("Comfort noise unavailable: {}", e);
            self.algorithm_buffer.zeros(out);
            self.last_error = Some(e);
        }
        self.last_mode = Mode::Rfc3389Cng;
        self.expand.reset();
        if !play_dtmf {
            self.dtmf_tone_generator.reset();
        }
        Ok(())
    }

    /// Let the active decoder produce its own comfort noise.
    fn do_codec_internal_cng(&mut self) {
        let channels = self.sync_buffer.channels();
        let mut decoded = AudioMultiVector::new(channels);
        if let Some(payload_type) = self.decoder_database.active_decoder() {
            if let Some(decoder) = self.decoder_database.decoder_mut(payload_type) {
                match decoder.decode(&[], &mut self.decoded_buffer) {
                    Ok((n, _)) => {
                        let n = n.min(self.decoded_buffer.len());
                        decoded.push_back_interleaved(&self.decoded_buffer[..n]);
                    }
                    Err(e) => debug!("No internal comfort noise: {}", e),
                }
            }
        }
        self.normal.process(
            &decoded,
            false,
            &mut self.expand,
            &self.sync_buffer,
            &self.background_noise,
            &mut self.mute_factors,
            &mut self.algorithm_buffer,
        );
        if self.algorithm_buffer.is_empty() {
            self.algorithm_buffer.zeros(self.output_size_samples);
        }
        self.last_mode = Mode::CodecInternalCng;
        self.expand.reset();
    }

    /// Play a frame of tone in place of audio.
    fn do_dtmf(&mut self, event: DtmfEvent) -> Result<()> {
        let out = self.output_size_samples;
        let generated = self.generate_tone(event, out);
        let tone = match generated {
            Ok(tone) => tone,
            Err(e) => {
                self.algorithm_buffer.zeros(out);
                return Err(e);
            }
        };
        self.algorithm_buffer = tone;
        self.sync_buffer.increase_end_timestamp(out as u32);
        self.expand.reset();
        self.last_mode = Mode::Dtmf;
        Ok(())
    }

    fn generate_tone(&mut self, event: DtmfEvent, len: usize) -> Result<AudioMultiVector> {
        if !self.dtmf_tone_generator.initialized() {
            self.dtmf_tone_generator
                .init(self.fs_hz, event.event_no, event.volume)?;
        }
        let mut tone = AudioMultiVector::new(self.sync_buffer.channels());
        self.dtmf_tone_generator.generate(len, &mut tone)?;
        Ok(tone)
    }

    /// Mix a running DTMF event over the frame just read, from where earlier
    /// tone audio ends.
    fn overdub_dtmf(&mut self, event: DtmfEvent, output: &mut [i16]) -> Result<()> {
        let out = self.output_size_samples;
        let channels = self.sync_buffer.channels();
        let dtmf_index = self.sync_buffer.dtmf_index();
        let next_index = self.sync_buffer.next_index();
        let out_index = if dtmf_index > next_index {
            (dtmf_index - next_index).min(out)
        } else {
            0
        };
        let tone = self.generate_tone(event, out - out_index)?;
        tone.read_interleaved(out - out_index, &mut output[out_index * channels..]);
        Ok(())
    }

    fn do_alternative_plc(&mut self, increase_timestamp: bool) {
        let out = self.output_size_samples;
        self.algorithm_buffer.zeros(out);
        // The timestamp stays, so these samples are inserted.
        self.stats.add_zeros(out);
        if increase_timestamp {
            self.sync_buffer.increase_end_timestamp(out as u32);
        }
        self.expand.reset();
    }

    /// Repeat the last frame in the sync buffer.
    fn do_audio_repetition(&mut self) {
        let out = self.output_size_samples;
        for ch in 0..self.sync_buffer.channels() {
            let tail = self.sync_buffer.tail(ch, out);
            self.algorithm_buffer.channel_mut(ch).extend_from_slice(&tail);
        }
        self.expand.reset();
    }
}
