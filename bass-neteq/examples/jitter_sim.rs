//! Simulated network feeding the playout engine.
//!
//! Usage: cargo run --example jitter_sim -- [jitter_ms] [loss_percent] [seconds]
//!
//! A 440 Hz tone is packetized into 20 ms L16 packets at 16 kHz. Each packet
//! gets a random network delay of up to `jitter_ms` and is lost with
//! `loss_percent` probability. The engine is pulled every 10 ms of simulated
//! time and its statistics are printed once per second.

use std::collections::BTreeMap;
use std::env;

use bass_neteq::codec::pcm::encode_l16;
use bass_neteq::{NetEq, NetEqConfig, OutputType, PayloadFormat, RtpHeader};

const SAMPLE_RATE: u32 = 16000;
const PACKET_MS: u32 = 20;
const PAYLOAD_TYPE: u8 = 96;

/// Small LCG so runs are repeatable without extra dependencies.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn arg(index: usize, default: u32) -> u32 {
    env::args()
        .nth(index)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let jitter_ms = arg(1, 60);
    let loss_percent = arg(2, 2);
    let seconds = arg(3, 10);
    println!(
        "Simulating {} s at {} Hz, jitter up to {} ms, {}% loss",
        seconds, SAMPLE_RATE, jitter_ms, loss_percent
    );

    let config = NetEqConfig {
        sample_rate_hz: SAMPLE_RATE,
        ..Default::default()
    };
    let neteq = NetEq::new(config)?;
    neteq.register_payload_type(
        PAYLOAD_TYPE,
        PayloadFormat::L16 {
            sample_rate_hz: SAMPLE_RATE,
            channels: 1,
        },
    )?;

    let samples_per_packet = (SAMPLE_RATE * PACKET_MS / 1000) as usize;
    let total_packets = seconds * 1000 / PACKET_MS;
    let mut rng = Lcg(0x5eed);

    // (arrival time in ms, sequence number)
    let mut arrivals: Vec<(u32, u16)> = Vec::new();
    for seq in 0..total_packets {
        if rng.next_f64() * 100.0 < loss_percent as f64 {
            continue;
        }
        let delay = (rng.next_f64() * jitter_ms as f64) as u32;
        arrivals.push((seq * PACKET_MS + delay, seq as u16));
    }
    arrivals.sort();

    let mut next_arrival = 0;
    let mut frame = vec![0i16; (SAMPLE_RATE / 100) as usize];
    let mut output_types: BTreeMap<&'static str, u32> = BTreeMap::new();
    let end_ms = seconds * 1000 + jitter_ms;

    for now_ms in (0..end_ms).step_by(10) {
        while next_arrival < arrivals.len() && arrivals[next_arrival].0 <= now_ms {
            let seq = arrivals[next_arrival].1;
            let timestamp = seq as u32 * samples_per_packet as u32;
            let tone: Vec<i16> = (0..samples_per_packet)
                .map(|i| {
                    let t = (timestamp as usize + i) as f64 / SAMPLE_RATE as f64;
                    (8000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
                })
                .collect();
            let header = RtpHeader {
                payload_type: PAYLOAD_TYPE,
                sequence_number: seq,
                timestamp,
                ssrc: 0xC0FFEE,
                marker: seq == 0,
            };
            neteq.insert_packet(header, &encode_l16(&tone), now_ms * SAMPLE_RATE / 1000)?;
            next_arrival += 1;
        }

        let info = neteq.get_audio(&mut frame)?;
        let label = match info.output_type {
            OutputType::Normal => "normal",
            OutputType::Plc => "plc",
            OutputType::PlcToCng => "plc_to_cng",
            OutputType::Cng => "cng",
            OutputType::VadPassive => "vad_passive",
        };
        *output_types.entry(label).or_default() += 1;

        if now_ms % 1000 == 990 {
            let stats = neteq.network_statistics();
            println!(
                "t={:>5} ms  delay={:>3} ms  target={:>3} ms  {}",
                now_ms + 10,
                neteq.current_delay_ms(),
                neteq.target_delay_ms(),
                stats.format_display()
            );
        }
    }

    println!("Output frames: {:?}", output_types);
    let operations: Vec<String> = neteq
        .operation_counts()
        .iter()
        .map(|(op, count)| format!("{}={}", op, count))
        .collect();
    println!("Operations: {}", operations.join(" "));
    Ok(())
}
