use crate::error::{OperationKind, map_io_error, timeout_error};
use bytes::{Bytes, BytesMut};
use rntbd_core::{FrameDecoder, TransportError};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

/// 在时限内执行 IO Future，超时映射为 [`TransportError::ConnectTimeout`]。
pub(crate) async fn run_with_deadline<F, T>(
    kind: OperationKind,
    limit: Duration,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    let sleep = tokio::time::sleep(limit);
    tokio::pin!(sleep);
    tokio::pin!(future);
    tokio::select! {
        biased;
        result = &mut future => result.map_err(|err| map_io_error(kind, err)),
        _ = &mut sleep => Err(timeout_error(kind)),
    }
}

/// 从流中读取一个完整帧；EOF 视为对端关闭。
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
    kind: OperationKind,
) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(frame);
        }
        buf.reserve(READ_CHUNK);
        let read = reader
            .read_buf(buf)
            .await
            .map_err(|err| map_io_error(kind, err))?;
        if read == 0 {
            return Err(TransportError::channel_closed(format!(
                "peer closed the connection during {}",
                kind.message
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CONNECT, READ};
    use rntbd_core::{Guid, ResponseFrame};

    #[tokio::test(flavor = "multi_thread")]
    async fn deadline_turns_into_timeout_error() {
        let err = run_with_deadline(
            CONNECT,
            Duration::from_millis(20),
            futures::future::pending::<io::Result<()>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectTimeout {
                operation: "tcp connect"
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_frame_reassembles_split_input() {
        let frame = ResponseFrame::new(200, Guid::NIL).encode().expect("encode");
        let (head, tail) = frame.split_at(7);
        let mut reader = tokio_test_reader(vec![head.to_vec(), tail.to_vec()]);
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        let read = read_frame(&mut reader, &mut decoder, &mut buf, READ)
            .await
            .expect("frame");
        assert_eq!(read, frame);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eof_before_frame_is_channel_closed() {
        let mut reader = tokio_test_reader(vec![vec![1, 2]]);
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        let err = read_frame(&mut reader, &mut decoder, &mut buf, READ)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed { .. }));
    }

    /// 按块交付数据的内存读端，每次 `read` 最多返回一块。
    fn tokio_test_reader(chunks: Vec<Vec<u8>>) -> impl AsyncRead + Unpin {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in chunks {
                if server.write_all(&chunk).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        client
    }
}
