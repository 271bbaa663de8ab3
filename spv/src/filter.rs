//! Bloom filter over the wallet's watched addresses. Full nodes use the
//! filter loaded by `filterload` to decide which transactions to forward.

use crate::network::{FilterLoad, Message};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher;
use std::collections::HashSet;
use std::hash::Hasher;
use thiserror::Error;
use tracing::debug;

/// Smallest element budget a reloaded filter is sized for
const MIN_FILTER_ELEMENTS: usize = 16;

/// Bloom filter error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("False positive rate must be between 0.0 and 1.0")]
    InvalidFalsePositiveRate,

    #[error("Filter size must be greater than 0")]
    InvalidSize,

    #[error("Hash count must be greater than 0")]
    InvalidHashCount,
}

/// Plain bloom filter, hashed with SipHash keyed by tweak and hash index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_count: u32,
    bit_count: usize,
    element_count: usize,
    tweak: u32,
}

impl BloomFilter {
    /// m = -(n * ln(p)) / (ln(2)^2)
    pub fn calculate_optimal_size(expected_elements: usize, false_positive_rate: f64) -> usize {
        if expected_elements == 0 || false_positive_rate <= 0.0 || false_positive_rate >= 1.0 {
            return 1024;
        }

        let n = expected_elements as f64;
        let m = -(n * false_positive_rate.ln()) / (2.0_f64.ln().powi(2));
        m.ceil() as usize
    }

    /// k = (m / n) * ln(2)
    pub fn calculate_optimal_hash_count(filter_size: usize, expected_elements: usize) -> u32 {
        if expected_elements == 0 {
            return 1;
        }

        let k = (filter_size as f64 / expected_elements as f64) * 2.0_f64.ln();
        k.ceil().clamp(1.0, 50.0) as u32
    }

    pub fn new(
        expected_elements: usize,
        false_positive_rate: f64,
        tweak: u32,
    ) -> Result<Self, FilterError> {
        if false_positive_rate <= 0.0 || false_positive_rate >= 1.0 {
            return Err(FilterError::InvalidFalsePositiveRate);
        }

        let bit_count = Self::calculate_optimal_size(expected_elements, false_positive_rate);
        let hash_count = Self::calculate_optimal_hash_count(bit_count, expected_elements);
        Self::with_size(bit_count, hash_count, tweak)
    }

    pub fn with_size(bit_count: usize, hash_count: u32, tweak: u32) -> Result<Self, FilterError> {
        if bit_count == 0 {
            return Err(FilterError::InvalidSize);
        }
        if hash_count == 0 {
            return Err(FilterError::InvalidHashCount);
        }

        Ok(Self {
            bits: vec![0u8; (bit_count + 7) / 8],
            hash_count,
            bit_count,
            element_count: 0,
            tweak,
        })
    }

    pub fn add<T: AsRef<[u8]>>(&mut self, element: T) {
        let data = element.as_ref();
        for i in 0..self.hash_count {
            let bit_index = self.bit_index(data, i);
            self.bits[bit_index / 8] |= 1u8 << (bit_index % 8);
        }
        self.element_count += 1;
    }

    pub fn contains<T: AsRef<[u8]>>(&self, element: T) -> bool {
        let data = element.as_ref();
        (0..self.hash_count).all(|i| {
            let bit_index = self.bit_index(data, i);
            self.bits[bit_index / 8] & (1u8 << (bit_index % 8)) != 0
        })
    }

    fn bit_index(&self, data: &[u8], hash_index: u32) -> usize {
        let mut hasher = SipHasher::new_with_keys(u64::from(self.tweak), u64::from(hash_index));
        hasher.write(data);
        (hasher.finish() % self.bit_count as u64) as usize
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.element_count = 0;
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    /// Estimated false positive rate for the current fill
    pub fn estimated_false_positive_rate(&self) -> f64 {
        if self.element_count == 0 {
            return 0.0;
        }
        let k = self.hash_count as f64;
        let m = self.bit_count as f64;
        let n = self.element_count as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn to_filter_load(&self) -> FilterLoad {
        FilterLoad {
            filter: self.bits.clone(),
            bit_count: self.bit_count,
            hash_count: self.hash_count,
            tweak: self.tweak,
        }
    }
}

/// Source of the filter the client loads on its peers
pub trait FilterSource: Send + Sync {
    /// Current `filterload` message
    fn filter_load_message(&self) -> Message;

    /// Rebuild the address filter from the watched set
    fn reload_addr_filter(&self);

    /// Start watching `address`; takes effect on the next reload
    fn add_address(&self, address: &[u8]);
}

struct AddrFilterState {
    addresses: HashSet<Vec<u8>>,
    filter: BloomFilter,
}

/// Address filter. Every reload picks a fresh tweak, so transactions that
/// matched only by accident stop matching after a reload.
pub struct AddrFilter {
    false_positive_rate: f64,
    state: RwLock<AddrFilterState>,
}

impl AddrFilter {
    pub fn new(false_positive_rate: f64) -> Result<Self, FilterError> {
        let filter = BloomFilter::new(MIN_FILTER_ELEMENTS, false_positive_rate, rand::random())?;
        Ok(Self {
            false_positive_rate,
            state: RwLock::new(AddrFilterState {
                addresses: HashSet::new(),
                filter,
            }),
        })
    }

    pub fn with_addresses<I>(false_positive_rate: f64, addresses: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let filter = Self::new(false_positive_rate)?;
        filter.state.write().addresses.extend(addresses);
        filter.reload_addr_filter();
        Ok(filter)
    }

    pub fn contains_address(&self, address: &[u8]) -> bool {
        self.state.read().filter.contains(address)
    }

    pub fn address_count(&self) -> usize {
        self.state.read().addresses.len()
    }

    pub fn tweak(&self) -> u32 {
        self.state.read().filter.tweak()
    }
}

impl FilterSource for AddrFilter {
    fn filter_load_message(&self) -> Message {
        Message::FilterLoad(self.state.read().filter.to_filter_load())
    }

    fn reload_addr_filter(&self) {
        let mut state = self.state.write();
        let expected = state.addresses.len().max(MIN_FILTER_ELEMENTS);
        // The rate was validated in `new`, so rebuilding cannot fail
        let mut filter = match BloomFilter::new(expected, self.false_positive_rate, rand::random()) {
            Ok(filter) => filter,
            Err(_) => return,
        };
        for address in &state.addresses {
            filter.add(address);
        }
        debug!(
            "Reloaded address filter: {} addresses, tweak {}",
            state.addresses.len(),
            filter.tweak()
        );
        state.filter = filter;
    }

    fn add_address(&self, address: &[u8]) {
        self.state.write().addresses.insert(address.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_membership() {
        let mut filter = BloomFilter::new(100, 0.01, 7).unwrap();
        filter.add(b"address-1");
        filter.add(b"address-2");

        assert!(filter.contains(b"address-1"));
        assert!(filter.contains(b"address-2"));
        assert_eq!(filter.element_count(), 2);

        filter.clear();
        assert!(!filter.contains(b"address-1"));
    }

    #[test]
    fn test_optimal_parameters() {
        let size = BloomFilter::calculate_optimal_size(1000, 0.01);
        assert!(size > 9000 && size < 10000);
        let k = BloomFilter::calculate_optimal_hash_count(size, 1000);
        assert_eq!(k, 7);
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            BloomFilter::new(10, 1.5, 0).unwrap_err(),
            FilterError::InvalidFalsePositiveRate
        );
        assert_eq!(BloomFilter::with_size(0, 3, 0).unwrap_err(), FilterError::InvalidSize);
        assert_eq!(BloomFilter::with_size(64, 0, 0).unwrap_err(), FilterError::InvalidHashCount);
    }

    #[test]
    fn test_addr_filter_reload() {
        let filter = AddrFilter::new(0.001).unwrap();
        filter.add_address(b"watched");
        assert!(!filter.contains_address(b"watched"));

        filter.reload_addr_filter();
        assert!(filter.contains_address(b"watched"));
        assert_eq!(filter.address_count(), 1);

        match filter.filter_load_message() {
            Message::FilterLoad(load) => {
                assert_eq!(load.tweak, filter.tweak());
                assert!(load.filter.iter().any(|byte| *byte != 0));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_with_addresses() {
        let filter = AddrFilter::with_addresses(0.001, vec![b"a".to_vec(), b"b".to_vec()]).unwrap();
        assert!(filter.contains_address(b"a"));
        assert!(filter.contains_address(b"b"));
    }
}
