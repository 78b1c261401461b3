//! Fork-join helpers for the per-tick stages.
//!
//! Each call is a barrier: it returns only after every item was processed,
//! so consecutive stages never overlap.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Run `f` over every item, at least `batch_size` items per rayon task.
#[inline]
pub fn parallel_for<T, F>(items: &mut [T], batch_size: usize, f: F)
where
    T: Send,
    F: Fn(&mut T) + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        items
            .par_iter_mut()
            .with_min_len(batch_size.max(1))
            .for_each(f);
    }

    #[cfg(not(feature = "parallel"))]
    {
        let _ = batch_size;
        items.iter_mut().for_each(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_for_visits_all() {
        let mut items: Vec<u32> = (0..1000).collect();
        parallel_for(&mut items, 16, |v| *v *= 2);
        assert!(items.iter().enumerate().all(|(i, v)| *v == i as u32 * 2));
    }
}
