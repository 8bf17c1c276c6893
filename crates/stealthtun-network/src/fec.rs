//! Forward Error Correction (XOR parity)
//!
//! Splits a payload into `D` data shards and appends `P` identical XOR
//! parity shards. XOR parity can rebuild exactly one missing data shard;
//! anything beyond that is a decode failure, which the tunnel treats as
//! packet loss.

use crate::error::{NetworkError, NetworkResult};

/// XOR-parity codec
pub struct Fec {
    data_shards: usize,
    parity_shards: usize,
    shard_size: usize,
}

impl Fec {
    /// Create a codec. All parameters must be positive.
    pub fn new(data_shards: usize, parity_shards: usize, shard_size: usize) -> NetworkResult<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(NetworkError::Fec(
                "data and parity shard counts must be positive".into(),
            ));
        }
        if shard_size == 0 {
            return Err(NetworkError::Fec("shard size must be positive".into()));
        }

        Ok(Self {
            data_shards,
            parity_shards,
            shard_size,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Split `data` into data shards (zero padded) plus parity shards.
    pub fn encode(&self, data: &[u8]) -> NetworkResult<Vec<Vec<u8>>> {
        if data.is_empty() {
            return Err(NetworkError::Fec("empty payload".into()));
        }

        let mut shard_size = data.len().div_ceil(self.data_shards);
        if shard_size < self.shard_size {
            shard_size = self.shard_size;
        }

        let mut shards = Vec::with_capacity(self.total_shards());
        for i in 0..self.data_shards {
            let mut shard = vec![0u8; shard_size];
            let start = i * shard_size;
            if start < data.len() {
                let end = (start + shard_size).min(data.len());
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
            shards.push(shard);
        }

        for _ in 0..self.parity_shards {
            let mut parity = vec![0u8; shard_size];
            for shard in &shards[..self.data_shards] {
                for (p, b) in parity.iter_mut().zip(shard) {
                    *p ^= b;
                }
            }
            shards.push(parity);
        }

        Ok(shards)
    }

    /// Rebuild the payload from shards, repairing at most one missing data
    /// shard from any present parity shard.
    pub fn decode(&self, shards: &[Vec<u8>], present: &[bool]) -> NetworkResult<Vec<u8>> {
        if shards.len() != self.total_shards() {
            return Err(NetworkError::Fec(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }
        if present.len() != shards.len() {
            return Err(NetworkError::Fec("present flags length mismatch".into()));
        }

        let present_count = present.iter().filter(|p| **p).count();
        if present_count < self.data_shards {
            return Err(NetworkError::Fec(
                "not enough shards to reconstruct".into(),
            ));
        }

        let shard_size = shards
            .iter()
            .zip(present)
            .find(|(s, p)| **p && !s.is_empty())
            .map(|(s, _)| s.len())
            .ok_or_else(|| NetworkError::Fec("no usable shard to size from".into()))?;

        let missing: Vec<usize> = (0..self.data_shards).filter(|i| !present[*i]).collect();

        let repaired: Option<(usize, Vec<u8>)> = match missing.as_slice() {
            [] => None,
            [idx] => {
                let parity_idx = (self.data_shards..self.total_shards())
                    .find(|i| present[*i])
                    .ok_or_else(|| {
                        NetworkError::Fec("missing data shard and no parity available".into())
                    })?;

                let mut shard = shards[parity_idx].clone();
                for (i, other) in shards[..self.data_shards].iter().enumerate() {
                    if i != *idx {
                        for (s, b) in shard.iter_mut().zip(other) {
                            *s ^= b;
                        }
                    }
                }
                Some((*idx, shard))
            }
            // Identical parity shards carry no extra information; two or
            // more lost data shards are unrecoverable.
            _ => {
                return Err(NetworkError::Fec(
                    "too many missing data shards for XOR parity".into(),
                ))
            }
        };

        let mut result = Vec::with_capacity(self.data_shards * shard_size);
        for i in 0..self.data_shards {
            match &repaired {
                Some((idx, shard)) if *idx == i => result.extend_from_slice(shard),
                _ => result.extend_from_slice(&shards[i]),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_validation() {
        assert!(Fec::new(0, 1, 64).is_err());
        assert!(Fec::new(4, 0, 64).is_err());
        assert!(Fec::new(4, 1, 0).is_err());
        assert!(Fec::new(4, 1, 64).is_ok());
    }

    #[test]
    fn test_encode_shape() {
        let fec = Fec::new(4, 2, 8).unwrap();
        let shards = fec.encode(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(shards.len(), 6);
        for shard in &shards {
            assert_eq!(shard.len(), 8);
        }
    }

    #[test]
    fn test_roundtrip_without_loss() {
        let fec = Fec::new(3, 1, 4).unwrap();
        let data = b"hello fec world".to_vec();

        let shards = fec.encode(&data).unwrap();
        let present = vec![true; shards.len()];
        let decoded = fec.decode(&shards, &present).unwrap();
        assert_eq!(&decoded[..data.len()], data.as_slice());
    }

    #[test]
    fn test_single_missing_data_shard_repairs() {
        let fec = Fec::new(4, 2, 16).unwrap();
        let data: Vec<u8> = (0..60).collect();
        let shards = fec.encode(&data).unwrap();

        // Any single data shard can be rebuilt.
        for missing in 0..4 {
            let mut damaged = shards.clone();
            damaged[missing] = Vec::new();
            let mut present = vec![true; shards.len()];
            present[missing] = false;

            let decoded = fec.decode(&damaged, &present).unwrap();
            assert_eq!(&decoded[..data.len()], data.as_slice());
        }
    }

    #[test]
    fn test_two_missing_data_shards_fail() {
        let fec = Fec::new(4, 2, 16).unwrap();
        let data: Vec<u8> = (0..60).collect();
        let mut shards = fec.encode(&data).unwrap();

        shards[0] = Vec::new();
        shards[1] = Vec::new();
        let mut present = vec![true; shards.len()];
        present[0] = false;
        present[1] = false;

        assert!(fec.decode(&shards, &present).is_err());
    }

    #[test]
    fn test_insufficient_shards_fail() {
        let fec = Fec::new(4, 1, 16).unwrap();
        let data: Vec<u8> = (0..60).collect();
        let mut shards = fec.encode(&data).unwrap();

        // Lose one data shard and the only parity shard.
        shards[0] = Vec::new();
        shards[4] = Vec::new();
        let present = vec![false, true, true, true, false];

        assert!(fec.decode(&shards, &present).is_err());
    }

    #[test]
    fn test_missing_parity_only_is_fine() {
        let fec = Fec::new(3, 2, 8).unwrap();
        let data: Vec<u8> = (0..20).collect();
        let mut shards = fec.encode(&data).unwrap();

        shards[3] = Vec::new();
        shards[4] = Vec::new();
        let present = vec![true, true, true, false, false];

        let decoded = fec.decode(&shards, &present).unwrap();
        assert_eq!(&decoded[..data.len()], data.as_slice());
    }
}
