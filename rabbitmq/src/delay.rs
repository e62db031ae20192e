//! Delay-delivery engine. A binary-exponential cascade of 28 TTL-chained
//! queues realizes delays up to `2^28 - 1` seconds (~8.5 years) entirely
//! from broker-native exchanges, queue TTL and dead-lettering — no
//! scheduler plugin required.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tokio::sync::Mutex;

use crate::error::TopologyError;

pub const LEVELS: u32 = 28;
pub const MAX_DELAY_SECS: u64 = (1u64 << LEVELS) - 1;

const LEVEL_PREFIX: &str = "rabbids.delay-level-";
const TERMINAL_EXCHANGE: &str = "rabbids.delay-delivery";

fn level_name(k: u32) -> String {
    format!("{LEVEL_PREFIX}{k}")
}

fn dlx_for_level(k: u32) -> String {
    if k == 0 {
        TERMINAL_EXCHANGE.to_string()
    } else {
        level_name(k - 1)
    }
}

/// Builds the 28-digit `b27.b26...b0` binary prefix for `sec`, high bit
/// first, each digit followed by a dot.
fn bit_prefix(sec: u64) -> String {
    let mut out = String::with_capacity((LEVELS as usize) * 2);
    for i in (0..LEVELS).rev() {
        let bit = (sec >> i) & 1;
        out.push(if bit == 1 { '1' } else { '0' });
        out.push('.');
    }
    out
}

fn highest_set_bit(sec: u64) -> Option<u32> {
    if sec == 0 {
        None
    } else {
        Some(63 - sec.leading_zeros())
    }
}

/// Computes the routing key and first-applicable exchange for a delay of
/// `delay` seconds heading to `address`. `delay` is clamped to
/// [`MAX_DELAY_SECS`]. Returns `(routing_key, first_exchange)` where
/// `first_exchange` lets the producer skip levels whose bit is already
/// clear.
pub fn calculate_routing_key(delay: Duration, address: &str) -> (String, String) {
    let sec = delay.as_secs().min(MAX_DELAY_SECS);
    let routing_key = format!("{}{}", bit_prefix(sec), address);
    let first_exchange = match highest_set_bit(sec) {
        Some(bit) => level_name(bit),
        None => level_name(0),
    };
    (routing_key, first_exchange)
}

/// Declares the 28-level cascade plus the terminal exchange, latched so it
/// only happens once per producer instance even under concurrent `Send`
/// calls.
pub struct DelayEngine {
    declared: Mutex<bool>,
    // Fast-path check avoiding the mutex once the topology is up.
    declared_flag: AtomicBool,
}

impl DelayEngine {
    pub fn new() -> Self {
        Self {
            declared: Mutex::new(false),
            declared_flag: AtomicBool::new(false),
        }
    }

    /// Declares the cascade topology if it hasn't been declared yet on this
    /// instance. Safe to call concurrently; only the first caller actually
    /// talks to the broker.
    pub async fn ensure_declared(&self, channel: &Channel) -> Result<(), TopologyError> {
        if self.declared_flag.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut declared = self.declared.lock().await;
        if *declared {
            return Ok(());
        }
        declare_cascade(channel).await?;
        *declared = true;
        self.declared_flag.store(true, Ordering::Release);
        Ok(())
    }

    /// Binds the terminal exchange to the caller's destination queue, so a
    /// message that has finished cascading through every set bit lands in
    /// `address`. Idempotent — safe to call once per distinct address.
    pub async fn declare_target_binding(
        &self,
        channel: &Channel,
        address: &str,
    ) -> Result<(), TopologyError> {
        channel
            .queue_bind(
                address,
                TERMINAL_EXCHANGE,
                &format!("#.{address}"),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError {
                entity: format!("delay-delivery binding for {address}"),
                cause: e.to_string(),
            })
    }
}

impl Default for DelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn declare_cascade(channel: &Channel) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            TERMINAL_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError {
            entity: TERMINAL_EXCHANGE.to_string(),
            cause: e.to_string(),
        })?;

    for k in (0..LEVELS).rev() {
        let name = level_name(k);

        channel
            .exchange_declare(
                &name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError {
                entity: format!("exchange {name}"),
                cause: e.to_string(),
            })?;

        let mut args = FieldTable::default();
        args.insert(
            "x-queue-mode".into(),
            AMQPValue::LongString("lazy".into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt((1i64 << k) * 1000),
        );
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx_for_level(k).as_str().into()),
        );

        channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| TopologyError {
                entity: format!("queue {name}"),
                cause: e.to_string(),
            })?;

        // First pass: queue <- own exchange, "bit k is set" pattern.
        let first_pass_key = bit_set_pattern(k, true);
        channel
            .queue_bind(
                &name,
                &name,
                &first_pass_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TopologyError {
                entity: format!("binding {name} <- {name} ({first_pass_key})"),
                cause: e.to_string(),
            })?;

        // Second pass: exchange level-(k-1) <- exchange level-k, "bit k clear".
        if k > 0 {
            let second_pass_key = bit_set_pattern(k, false);
            let lower = level_name(k - 1);
            channel
                .exchange_bind(
                    &lower,
                    &name,
                    &second_pass_key,
                    lapin::options::ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TopologyError {
                    entity: format!("exchange binding {lower} <- {name} ({second_pass_key})"),
                    cause: e.to_string(),
                })?;
        }
    }

    // Terminal exchange <- level-0, all-zeros pattern.
    let all_zero = bit_set_pattern_all_zero();
    channel
        .exchange_bind(
            TERMINAL_EXCHANGE,
            &level_name(0),
            &all_zero,
            lapin::options::ExchangeBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| TopologyError {
            entity: format!("exchange binding {TERMINAL_EXCHANGE} <- {} ({all_zero})", level_name(0)),
            cause: e.to_string(),
        })?;

    Ok(())
}

/// Builds a binding pattern that matches on bit `k` being set (or clear)
/// and wildcards every other segment.
fn bit_set_pattern(k: u32, set: bool) -> String {
    let mut segments = Vec::with_capacity((LEVELS as usize) + 1);
    for i in (0..LEVELS).rev() {
        if i == k {
            segments.push(if set { "1" } else { "0" }.to_string());
        } else {
            segments.push("*".to_string());
        }
    }
    segments.push("#".to_string());
    segments.join(".")
}

fn bit_set_pattern_all_zero() -> String {
    let mut segments = vec!["0".to_string(); LEVELS as usize];
    segments.push("#".to_string());
    segments.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(0), "q");
        assert_eq!(
            key,
            "0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.q"
        );
        assert_eq!(exchange, "rabbids.delay-level-0");
    }

    #[test]
    fn one_second_delay() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(1), "q");
        assert!(key.ends_with("1.q"));
        assert_eq!(exchange, "rabbids.delay-level-0");
    }

    #[test]
    fn five_second_delay_sets_bits_zero_and_two() {
        let (key, exchange) = calculate_routing_key(Duration::from_secs(5), "q");
        assert_eq!(exchange, "rabbids.delay-level-2");
        let segments: Vec<&str> = key.split('.').collect();
        // 28 bit-digits + address.
        assert_eq!(segments.len(), 29);
        // Position 25 is bit 2 (27 - 25 = 2), position 27 is bit 0.
        assert_eq!(segments[25], "1");
        assert_eq!(segments[27], "1");
        for (i, seg) in segments.iter().enumerate().take(28) {
            if i != 25 && i != 27 {
                assert_eq!(*seg, "0", "unexpected set bit at segment {i}");
            }
        }
    }

    #[test]
    fn delay_beyond_max_is_clamped() {
        let (key, _) = calculate_routing_key(Duration::from_secs(MAX_DELAY_SECS + 1_000_000), "q");
        let (key_at_max, _) = calculate_routing_key(Duration::from_secs(MAX_DELAY_SECS), "q");
        assert_eq!(key, key_at_max);
    }

    #[test]
    fn routing_key_segment_matches_bit_definition() {
        let sec = 0b1010u64; // bits 1 and 3 set
        let (key, _) = calculate_routing_key(Duration::from_secs(sec), "dest");
        let segments: Vec<&str> = key.split('.').collect();
        for (i, seg) in segments.iter().enumerate().take(28) {
            let bit = 27 - i as u32;
            let expected = if (sec >> bit) & 1 == 1 { "1" } else { "0" };
            assert_eq!(*seg, expected, "segment {i} (bit {bit}) mismatch");
        }
        assert_eq!(segments[28], "dest");
    }
}
