//! bass-neteq: adaptive jitter buffer and playout engine for RTP audio.
//!
//! Packets go in with [`NetEq::insert_packet`] as they arrive from the
//! network; 10 ms frames of PCM come out of [`NetEq::get_audio`] at the
//! audio clock. In between the engine:
//! - measures packet inter-arrival jitter and keeps a target buffer delay
//!   ([`delay_manager`]),
//! - decides every tick whether to play, conceal, stretch time or play
//!   comfort noise ([`decision_logic`]),
//! - runs the matching signal processing ([`dsp`]).
//!
//! ```no_run
//! use bass_neteq::{NetEq, NetEqConfig, PayloadFormat, RtpHeader};
//!
//! let neteq = NetEq::new(NetEqConfig::default())?;
//! neteq.register_payload_type(0, PayloadFormat::Pcmu)?;
//!
//! let header = RtpHeader { payload_type: 0, sequence_number: 1, timestamp: 160, ssrc: 7, marker: false };
//! neteq.insert_packet(header, &[0xFF; 160], 0)?;
//!
//! let mut frame = vec![0i16; 160];
//! let info = neteq.get_audio(&mut frame)?;
//! println!("{:?}", info.output_type);
//! # Ok::<(), bass_neteq::NetEqError>(())
//! ```

pub mod audio_vector;
pub mod buffer_level_filter;
pub mod codec;
pub mod config;
pub mod decision_logic;
pub mod delay_manager;
pub mod delay_peak_detector;
pub mod dsp;
pub mod dtmf;
pub mod engine;
pub mod error;
pub mod packet;
pub mod packet_buffer;
pub mod playout;
pub mod statistics;
pub mod sync_buffer;
pub mod tick_timer;

pub use codec::{AudioDecoder, CodecError, PayloadFormat, SpeechType};
pub use config::{BackgroundNoiseMode, NetEqConfig, PlayoutMode};
pub use decision_logic::Operation;
pub use dsp::{PitchStretcher, StretchResult, TimeStretcher};
pub use engine::{AudioFrame, NetEq, OutputType};
pub use error::{NetEqError, Result};
pub use packet::{Packet, RtpHeader};
pub use playout::{playout_channel, PlayoutPump, PlayoutReader};
pub use statistics::NetworkStatistics;
