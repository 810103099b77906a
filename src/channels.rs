//! Channel plumbing shared by the pipeline.

/// Capacity of the bounded channels connecting stages. Kept minimal so that
/// backpressure from the transport stage reaches the followers.
pub const CHANNEL_CAPACITY: usize = 1;

/// Multiplexes `inputs` into the returned receiver.
///
/// Every value sent on any input is forwarded exactly once; the output
/// closes only after all inputs have closed.
pub fn merge<T: Send + 'static>(
    inputs: Vec<async_channel::Receiver<T>>,
) -> async_channel::Receiver<T> {
    let (sender, receiver) = async_channel::bounded(CHANNEL_CAPACITY);

    for input in inputs {
        let sender = sender.clone();

        tokio::spawn(async move {
            while let Ok(value) = input.recv().await {
                if sender.send(value).await.is_err() {
                    return;
                }
            }
        });
    }

    // The forwarding tasks hold the only senders now; the output closes when
    // the last of them returns.
    receiver
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[tokio::test]
    async fn merge_forwards_every_value_exactly_once() {
        let (first_tx, first_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let (second_tx, second_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let merged = merge(vec![first_rx, second_rx]);

        tokio::spawn(async move {
            for value in ["a", "b"] {
                first_tx.send(value.to_string()).await.unwrap();
            }
        });
        tokio::spawn(async move {
            for value in ["c", "d"] {
                second_tx.send(value.to_string()).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Ok(value) = merged.recv().await {
            received.push(value);
        }

        assert_eq!(received.len(), 4);
        let unique = received.iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(
            unique,
            ["a", "b", "c", "d"]
                .iter()
                .map(ToString::to_string)
                .collect()
        );
    }

    #[tokio::test]
    async fn merge_closes_only_after_all_inputs_close() {
        let (first_tx, first_rx) = async_channel::bounded::<u32>(CHANNEL_CAPACITY);
        let (second_tx, second_rx) = async_channel::bounded::<u32>(CHANNEL_CAPACITY);
        let merged = merge(vec![first_rx, second_rx]);

        drop(first_tx);
        second_tx.send(7).await.unwrap();
        assert_eq!(merged.recv().await.unwrap(), 7);

        drop(second_tx);
        assert!(merged.recv().await.is_err());
    }
}
