use std::collections::VecDeque;

use crate::{
    crypto::{Crypto, CryptographyError},
    scheme::Scheme,
};

/// Randomly permute some items.
///
/// For each remaining count `k`, from `K` down to `1`, we draw `r` in
/// `[0, k - 1]`, rotate what's left by `r` to the left, and move the front
/// into the output. All of the randomness comes from the provider, so a
/// provider replaying fixed draws always gets the same permutation back.
pub fn shuffle<C: Scheme, T>(
    crypto: &impl Crypto<C>,
    items: Vec<T>,
) -> Result<Vec<T>, CryptographyError> {
    let mut remaining: VecDeque<T> = items.into();
    let mut out = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let k = remaining.len();
        let r = crypto.random(k - 1)?;
        if r >= k {
            return Err(CryptographyError::new(format!(
                "random draw {r} outside of [0, {}]",
                k - 1
            )));
        }
        remaining.rotate_left(r);
        // The queue is non empty, so this always pops something.
        if let Some(x) = remaining.pop_front() {
            out.push(x);
        }
    }
    Ok(out)
}

#[cfg(all(test, feature = "k256"))]
mod test {
    use k256::Secp256k1;
    use proptest::prelude::*;

    use super::*;
    use crate::{crypto::OsCrypto, test::FixedCrypto};

    #[test]
    fn test_fixed_draws_give_fixed_permutation() {
        let crypto = FixedCrypto::<Secp256k1>::new([2, 0, 0]);
        assert_eq!(shuffle(&crypto, vec![1, 2, 3]).unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_identity_draws() {
        let crypto = FixedCrypto::<Secp256k1>::new([0, 0, 0, 0]);
        assert_eq!(shuffle(&crypto, vec![1, 2, 3, 4]).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rotation_draws() {
        let crypto = FixedCrypto::<Secp256k1>::new([1, 1, 1, 0]);
        // [1,2,3,4] -> [2,3,4,1] pop 2; [3,4,1] -> [4,1,3] pop 4;
        // [1,3] -> [3,1] pop 3; [1] pop 1.
        assert_eq!(shuffle(&crypto, vec![1, 2, 3, 4]).unwrap(), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_empty_input() {
        let crypto = FixedCrypto::<Secp256k1>::new([]);
        assert_eq!(shuffle(&crypto, Vec::<u8>::new()).unwrap(), vec![]);
    }

    #[test]
    fn test_out_of_range_draw_is_an_error() {
        let crypto = FixedCrypto::<Secp256k1>::new([5, 0]);
        assert!(shuffle(&crypto, vec![1, 2]).is_err());
    }

    #[test]
    fn test_exhausted_draws_are_an_error() {
        let crypto = FixedCrypto::<Secp256k1>::new([0]);
        assert!(shuffle(&crypto, vec![1, 2]).is_err());
    }

    proptest! {
        #[test]
        fn test_shuffle_is_a_permutation(items in proptest::collection::vec(any::<u16>(), 0..40)) {
            let crypto = OsCrypto::<Secp256k1>::new();
            let mut shuffled = shuffle(&crypto, items.clone()).unwrap();
            prop_assert_eq!(shuffled.len(), items.len());

            let mut sorted = items;
            sorted.sort();
            shuffled.sort();
            prop_assert_eq!(shuffled, sorted);
        }
    }
}
