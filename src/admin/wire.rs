// Copyright 2025 the Portward authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! String framing for the control wire: a big-endian u32 length followed by
//! that many UTF-8 bytes. One request and one response per connection.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame body. A command batch or response never
/// legitimately approaches this; anything larger is a broken peer.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

pub async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_FRAME_LEN as usize {
        bail!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            bytes.len()
        );
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader
        .read_u32()
        .await
        .context("failed to read the frame length")?;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit");
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read the frame body")?;
    String::from_utf8(body).context("frame body is not valid UTF-8")
}
