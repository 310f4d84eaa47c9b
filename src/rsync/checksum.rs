use eyre::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Block checksum header exchanged per file.
///
/// The all-zero header requests the whole file instead of a delta against a
/// local copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SumHead {
    pub checksum_count: i32,
    pub block_len: i32,
    pub checksum_len: i32,
    pub remainder_len: i32,
}

impl SumHead {
    pub async fn read_from<R: AsyncRead + Unpin>(rx: &mut R) -> Result<Self> {
        Ok(Self {
            checksum_count: rx.read_i32_le().await?,
            block_len: rx.read_i32_le().await?,
            checksum_len: rx.read_i32_le().await?,
            remainder_len: rx.read_i32_le().await?,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, tx: &mut W) -> Result<()> {
        tx.write_i32_le(self.checksum_count).await?;
        tx.write_i32_le(self.block_len).await?;
        tx.write_i32_le(self.checksum_len).await?;
        tx.write_i32_le(self.remainder_len).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_head_is_sixteen_zero_bytes() {
        let mut wire = Vec::new();
        SumHead::default().write_to(&mut wire).await.unwrap();
        assert_eq!(wire, vec![0u8; 16]);
    }

    #[tokio::test]
    async fn fields_decode_in_wire_order() {
        let mut wire = Vec::new();
        for v in [3i32, 700, 2, 100] {
            wire.extend(v.to_le_bytes());
        }
        let head = SumHead::read_from(&mut wire.as_slice()).await.unwrap();
        assert_eq!(
            head,
            SumHead {
                checksum_count: 3,
                block_len: 700,
                checksum_len: 2,
                remainder_len: 100,
            }
        );
    }
}
