use std::future::Future;

/// Map `items` through `task` with at most `batch_size` futures in flight.
///
/// Batches are strictly sequential: batch N+1 does not start until every
/// future in batch N has settled. One item's failure is just a value in the
/// result slot, so siblings and later batches always run. Results keep the
/// input order.
pub async fn map_in_batches<T, R, F, Fut>(items: Vec<T>, batch_size: usize, task: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());

    let mut remaining = items;
    while !remaining.is_empty() {
        let split_at = remaining.len().min(batch_size);
        let rest = remaining.split_off(split_at);
        let batch = std::mem::replace(&mut remaining, rest);

        let outputs = futures::future::join_all(batch.into_iter().map(&task)).await;
        results.extend(outputs);
    }

    results
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::map_in_batches;

    #[tokio::test]
    async fn preserves_input_order() {
        let items = (0..25).collect::<Vec<u32>>();
        let results = map_in_batches(items, 10, |item| async move { item * 2 }).await;
        assert_eq!(results, (0..25).map(|item| item * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_failure_never_cancels_siblings() {
        let items = (1..=12).collect::<Vec<u32>>();
        let results = map_in_batches(items, 10, |item| async move {
            if item == 7 {
                Err(format!("item {item} exploded"))
            } else {
                Ok(item)
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert_eq!(results.iter().filter(|result| result.is_err()).count(), 1);
        assert_eq!(results[6], Err("item 7 exploded".to_string()));
        assert_eq!(results[11], Ok(12));
    }

    #[tokio::test]
    async fn never_exceeds_the_batch_size() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let items = (0..37).collect::<Vec<u32>>();
        map_in_batches(items, 10, |_item| async {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tolerates_a_zero_batch_size_and_empty_input() {
        let results = map_in_batches(vec![1, 2, 3], 0, |item| async move { item }).await;
        assert_eq!(results, vec![1, 2, 3]);

        let empty: Vec<u32> = Vec::new();
        let results = map_in_batches(empty, 10, |item| async move { item }).await;
        assert!(results.is_empty());
    }
}
