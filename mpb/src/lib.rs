use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;

type Subscribers<X> = Arc<Mutex<Vec<Sender<X>>>>;

/// Multi-Producer Broadcast to do many to many (N*N) message passing.
///
/// Every message sent through any [`sender`](MPB::sender) is delivered to every receiver alive at that moment.
/// Receivers which have been dropped are forgotten on the next broadcast.
pub struct MPB<X>
where
    X: Clone + Send + Sync + 'static,
{
    sender: Sender<X>,
    subscribers: Subscribers<X>,
}

impl<X> MPB<X>
where
    X: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<X>();

        let mpb = MPB {
            sender,
            subscribers: Arc::new(Mutex::new(vec![])),
        };

        mpb.init(receiver);

        mpb
    }

    fn init(&self, receiver: Receiver<X>) {
        let subscribers = self.subscribers.clone();

        let _ = thread::Builder::new()
            .name("mpb".to_string())
            .spawn(move || {
                // ends once every sender, including the one held by the bus, is dropped
                for msg in receiver {
                    lock(&subscribers).retain(|subscriber| subscriber.send(msg.clone()).is_ok());
                }
            });
    }

    pub fn sender(&self) -> Sender<X> {
        self.sender.clone()
    }

    pub fn receiver(&self) -> Receiver<X> {
        let (sender, receiver) = unbounded();
        lock(&self.subscribers).push(sender);
        receiver
    }

    /// Number of receivers still subscribed.
    pub fn receiver_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

impl<X> Default for MPB<X>
where
    X: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<X>(subscribers: &Subscribers<X>) -> MutexGuard<'_, Vec<Sender<X>>> {
    match subscribers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("broadcast subscribers lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::MPB;

    #[test]
    fn every_receiver_gets_every_message() {
        let mpb = MPB::new();

        let sender1 = mpb.sender();
        let sender2 = mpb.sender();

        let receiver1 = mpb.receiver();
        let receiver2 = mpb.receiver();

        let j1 = thread::spawn(move || {
            let first = receiver1.recv_timeout(Duration::from_secs(1)).unwrap();
            let second = receiver1.recv_timeout(Duration::from_secs(1)).unwrap();
            (first, second)
        });

        let j2 = thread::spawn(move || {
            let first = receiver2.recv_timeout(Duration::from_secs(1)).unwrap();
            let second = receiver2.recv_timeout(Duration::from_secs(1)).unwrap();
            (first, second)
        });

        let _ = sender1.send("hello");
        let _ = sender2.send("world");

        assert_eq!(j1.join().unwrap(), ("hello", "world"));
        assert_eq!(j2.join().unwrap(), ("hello", "world"));
    }

    #[test]
    fn dropped_receivers_are_forgotten() {
        let mpb = MPB::new();
        let kept = mpb.receiver();
        drop(mpb.receiver());
        assert_eq!(mpb.receiver_count(), 2);

        let _ = mpb.sender().send(1_u8);
        assert_eq!(kept.recv_timeout(Duration::from_secs(1)), Ok(1));

        // the broadcast happens before `kept` receives, so the dead receiver is already pruned
        assert_eq!(mpb.receiver_count(), 1);
    }
}
