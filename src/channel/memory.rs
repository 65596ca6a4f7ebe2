use super::{ChannelError, FrameChannel, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

const DEPTH: usize = 16;

/// One end of an in-process duplex connection.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Two connected ends; frames sent on one are received on the other.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(DEPTH);
    let (b_tx, a_rx) = mpsc::channel(DEPTH);
    (
        MemoryChannel {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryChannel {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

#[async_trait]
impl FrameChannel for MemoryChannel {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(ChannelError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{read_json, write_json};
    use super::*;
    use eyre::Result;

    #[tokio::test]
    async fn frames_cross_over() -> Result<()> {
        let (mut a, mut b) = pair();
        write_json(&mut a, &vec![1, 2, 3]).await?;
        let got: Vec<u8> = read_json(&mut b).await?;
        assert_eq!(got, vec![1, 2, 3]);
        b.send_frame(b"pong".to_vec()).await?;
        assert_eq!(a.recv_frame().await?, b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn close_is_observed() -> Result<()> {
        let (mut a, mut b) = pair();
        a.close().await?;
        assert!(matches!(b.recv_frame().await, Err(ChannelError::Closed)));
        assert!(matches!(
            a.send_frame(vec![0]).await,
            Err(ChannelError::Closed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_peer_closes() {
        let (a, mut b) = pair();
        drop(a);
        assert!(matches!(b.recv_frame().await, Err(ChannelError::Closed)));
    }
}
