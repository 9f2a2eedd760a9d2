//! Byte-level encoding and decoding of [`Message`] records.
//!
//! Records are written back-to-back with no outer length prefix; each
//! starts with its 1-byte tag and the decoder derives the record boundary
//! from the payload layout. Integers are big-endian two's-complement.
//!
//! Strings use the Java-modified UTF-8 convention: the 4-byte length
//! field counts UTF-16 code units (not bytes), NUL encodes as the
//! overlong pair `C0 80`, there are no 4-byte sequences, and characters
//! outside the BMP travel as two 3-byte surrogate encodings. A length of
//! -1 denotes the null string. This is required for interop with existing
//! daemon peers.
//!
//! Encoding serializes a whole message into a caller-supplied buffer so
//! that one `write_all` keeps the record atomic with respect to other
//! writers; decoding reads incrementally from any buffered `AsyncRead`.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    error::DecodeError,
    message::{Message, MojoStarted, TransferEvent},
};

/// Largest string pre-allocation made on the strength of a length field
/// alone. Longer strings still decode; they just grow the buffer as bytes
/// actually arrive.
const MAX_EAGER_CHARS: usize = 64 * 1024;

/// Serialize `message` into `buf`.
///
/// The buffer holds exactly one record afterwards; flushing it with a
/// single write preserves the protocol's write atomicity contract.
pub fn encode_message(message: &Message, buf: &mut BytesMut) {
    buf.put_u8(message.tag());
    match message {
        Message::BuildRequest { args, working_dir, project_dir, env } => {
            put_string_list(buf, args);
            put_string(buf, working_dir);
            put_string(buf, project_dir);
            put_string_map(buf, env);
        },
        Message::BuildStarted {
            project_id,
            project_count,
            max_threads,
            artifact_id_display_length,
        } => {
            put_string(buf, project_id);
            buf.put_i32(*project_count);
            buf.put_i32(*max_threads);
            buf.put_i32(*artifact_id_display_length);
        },
        Message::BuildFinished { exit_code } => buf.put_i32(*exit_code),
        Message::ProjectStarted { project_id } | Message::ProjectStopped { project_id } => {
            put_string(buf, project_id);
        },
        Message::MojoStarted(mojo) => {
            put_string(buf, &mojo.artifact_id);
            put_string(buf, &mojo.plugin_group_id);
            put_string(buf, &mojo.plugin_artifact_id);
            put_string(buf, &mojo.plugin_goal_prefix);
            put_string(buf, &mojo.plugin_version);
            put_string(buf, &mojo.mojo);
            put_string(buf, &mojo.execution_id);
        },
        Message::ProjectLogMessage { project_id, message }
        | Message::Display { project_id, message } => {
            put_string(buf, project_id);
            put_string(buf, message);
        },
        Message::BuildLogMessage { message }
        | Message::BuildStatus { message }
        | Message::PrintOut { message }
        | Message::PrintErr { message } => put_string(buf, message),
        Message::BuildException { message, class_name, stack_trace } => {
            put_string(buf, message);
            put_string(buf, class_name);
            put_string(buf, stack_trace);
        },
        Message::KeepAlive | Message::Stop | Message::CancelBuild => {},
        Message::Prompt { project_id, uid, message, password } => {
            put_string(buf, project_id);
            put_string(buf, uid);
            put_string(buf, message);
            buf.put_u8(u8::from(*password));
        },
        Message::PromptResponse { project_id, uid, message } => {
            put_string(buf, project_id);
            put_string(buf, uid);
            put_string(buf, message);
        },
        Message::KeyboardInput { key } => {
            let mut tmp = [0u8; 4];
            put_string(buf, key.encode_utf8(&mut tmp));
        },
        Message::Transfer { event, .. } => {
            put_string(buf, &event.project_id);
            buf.put_u8(event.request_type);
            put_string(buf, &event.repository_id);
            put_string(buf, &event.repository_url);
            put_string(buf, &event.resource_name);
            buf.put_i64(event.content_length);
            buf.put_i64(event.transferred_bytes);
            put_opt_string(buf, event.exception.as_deref());
        },
        Message::ExecutionFailure { project_id, halted, exception } => {
            put_string(buf, project_id);
            buf.put_u8(u8::from(*halted));
            put_opt_string(buf, exception.as_deref());
        },
        Message::RequestInput { project_id, bytes_to_read } => {
            put_string(buf, project_id);
            buf.put_i32(*bytes_to_read);
        },
        Message::InputData { data } => put_opt_string(buf, data.as_deref()),
    }
}

/// Read the next record from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream (EOF exactly at a tag
/// boundary). EOF anywhere inside a record is [`DecodeError::UnexpectedEof`].
///
/// `reader` should be buffered; the decoder reads strings byte-wise.
///
/// # Errors
///
/// [`DecodeError::UnknownTag`] for tags outside 1..=28,
/// [`DecodeError::Malformed`] for invalid modified-UTF-8 bytes,
/// [`DecodeError::UnexpectedEof`] / [`DecodeError::Io`] for stream
/// failures.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DecodeError::Io(e)),
    };

    let message = match tag {
        Message::BUILD_REQUEST => Message::BuildRequest {
            args: read_string_list(reader).await?,
            working_dir: read_string(reader).await?,
            project_dir: read_string(reader).await?,
            env: read_string_map(reader).await?,
        },
        Message::BUILD_STARTED => Message::BuildStarted {
            project_id: read_string(reader).await?,
            project_count: read_i32(reader).await?,
            max_threads: read_i32(reader).await?,
            artifact_id_display_length: read_i32(reader).await?,
        },
        Message::BUILD_FINISHED => Message::BuildFinished { exit_code: read_i32(reader).await? },
        Message::PROJECT_STARTED => {
            Message::ProjectStarted { project_id: read_string(reader).await? }
        },
        Message::PROJECT_STOPPED => {
            Message::ProjectStopped { project_id: read_string(reader).await? }
        },
        Message::MOJO_STARTED => Message::MojoStarted(MojoStarted {
            artifact_id: read_string(reader).await?,
            plugin_group_id: read_string(reader).await?,
            plugin_artifact_id: read_string(reader).await?,
            plugin_goal_prefix: read_string(reader).await?,
            plugin_version: read_string(reader).await?,
            mojo: read_string(reader).await?,
            execution_id: read_string(reader).await?,
        }),
        Message::PROJECT_LOG_MESSAGE => Message::ProjectLogMessage {
            project_id: read_string(reader).await?,
            message: read_string(reader).await?,
        },
        Message::BUILD_LOG_MESSAGE => {
            Message::BuildLogMessage { message: read_string(reader).await? }
        },
        Message::BUILD_EXCEPTION => Message::BuildException {
            message: read_string(reader).await?,
            class_name: read_string(reader).await?,
            stack_trace: read_string(reader).await?,
        },
        Message::KEEP_ALIVE => Message::KeepAlive,
        Message::STOP => Message::Stop,
        Message::DISPLAY => Message::Display {
            project_id: read_string(reader).await?,
            message: read_string(reader).await?,
        },
        Message::PROMPT => Message::Prompt {
            project_id: read_string(reader).await?,
            uid: read_string(reader).await?,
            message: read_string(reader).await?,
            password: read_bool(reader).await?,
        },
        Message::PROMPT_RESPONSE => Message::PromptResponse {
            project_id: read_string(reader).await?,
            uid: read_string(reader).await?,
            message: read_string(reader).await?,
        },
        Message::BUILD_STATUS => Message::BuildStatus { message: read_string(reader).await? },
        Message::KEYBOARD_INPUT => {
            let text = read_string(reader).await?;
            let key = text.chars().next().ok_or(DecodeError::Malformed("empty keystroke"))?;
            Message::KeyboardInput { key }
        },
        Message::CANCEL_BUILD => Message::CancelBuild,
        Message::TRANSFER_INITIATED..=Message::TRANSFER_FAILED => {
            // transfer_phase covers exactly this tag range
            let phase = Message::transfer_phase(tag)
                .ok_or(DecodeError::Malformed("transfer phase out of range"))?;
            Message::Transfer {
                phase,
                event: TransferEvent {
                    project_id: read_string(reader).await?,
                    request_type: read_u8(reader).await?,
                    repository_id: read_string(reader).await?,
                    repository_url: read_string(reader).await?,
                    resource_name: read_string(reader).await?,
                    content_length: read_i64(reader).await?,
                    transferred_bytes: read_i64(reader).await?,
                    exception: read_opt_string(reader).await?,
                },
            }
        },
        Message::EXECUTION_FAILURE => Message::ExecutionFailure {
            project_id: read_string(reader).await?,
            halted: read_bool(reader).await?,
            exception: read_opt_string(reader).await?,
        },
        Message::PRINT_OUT => Message::PrintOut { message: read_string(reader).await? },
        Message::PRINT_ERR => Message::PrintErr { message: read_string(reader).await? },
        Message::REQUEST_INPUT => Message::RequestInput {
            project_id: read_string(reader).await?,
            bytes_to_read: read_i32(reader).await?,
        },
        Message::INPUT_DATA => Message::InputData { data: read_opt_string(reader).await? },
        other => return Err(DecodeError::UnknownTag(other)),
    };

    Ok(Some(message))
}

// Primitive readers. Every mid-record EOF maps to UnexpectedEof.

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, DecodeError> {
    reader.read_u8().await.map_err(DecodeError::from_read)
}

async fn read_bool<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, DecodeError> {
    Ok(read_u8(reader).await? != 0)
}

async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, DecodeError> {
    reader.read_i32().await.map_err(DecodeError::from_read)
}

async fn read_i64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i64, DecodeError> {
    reader.read_i64().await.map_err(DecodeError::from_read)
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, DecodeError> {
    read_opt_string(reader)
        .await?
        .ok_or(DecodeError::Malformed("null string where a value is required"))
}

/// Read a nullable modified-UTF-8 string.
///
/// The length field counts UTF-16 code units; the decoder therefore
/// consumes bytes until exactly that many units have been produced.
async fn read_opt_string<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, DecodeError> {
    let len = read_i32(reader).await?;
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| DecodeError::Malformed("negative string length"))?;

    let mut units: Vec<u16> = Vec::with_capacity(len.min(MAX_EAGER_CHARS));
    while units.len() < len {
        let a = read_u8(reader).await?;
        let unit = match a {
            0x00..=0x7f => u16::from(a),
            0x80..=0xbf => return Err(DecodeError::Malformed("invalid leading byte")),
            0xc0..=0xdf => {
                let b = read_u8(reader).await?;
                if b & 0xc0 != 0x80 {
                    return Err(DecodeError::Malformed("invalid continuation byte"));
                }
                (u16::from(a) & 0x1f) << 6 | u16::from(b) & 0x3f
            },
            0xe0..=0xef => {
                let b = read_u8(reader).await?;
                if b & 0xc0 != 0x80 {
                    return Err(DecodeError::Malformed("invalid continuation byte"));
                }
                let c = read_u8(reader).await?;
                if c & 0xc0 != 0x80 {
                    return Err(DecodeError::Malformed("invalid continuation byte"));
                }
                (u16::from(a) & 0x0f) << 12 | (u16::from(b) & 0x3f) << 6 | u16::from(c) & 0x3f
            },
            _ => return Err(DecodeError::Malformed("invalid leading byte")),
        };
        units.push(unit);
    }

    String::from_utf16(&units).map(Some).map_err(|_| DecodeError::Malformed("unpaired surrogate"))
}

async fn read_string_list<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<String>, DecodeError> {
    let count = read_i32(reader).await?;
    let count = usize::try_from(count).unwrap_or(0);
    let mut list = Vec::with_capacity(count.min(MAX_EAGER_CHARS));
    for _ in 0..count {
        list.push(read_string(reader).await?);
    }
    Ok(list)
}

async fn read_string_map<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<(String, String)>, DecodeError> {
    let count = read_i32(reader).await?;
    let count = usize::try_from(count).unwrap_or(0);
    let mut map = Vec::with_capacity(count.min(MAX_EAGER_CHARS));
    for _ in 0..count {
        let key = read_string(reader).await?;
        let value = read_string(reader).await?;
        map.push((key, value));
    }
    Ok(map)
}

// Primitive writers.

fn put_string(buf: &mut BytesMut, s: &str) {
    put_opt_string(buf, Some(s));
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    let Some(s) = s else {
        buf.put_i32(-1);
        return;
    };

    let units = s.encode_utf16().count();
    debug_assert!(units <= i32::MAX as usize, "string exceeds wire length field");
    buf.put_i32(units as i32);

    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007f => buf.put_u8(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                buf.put_u8(0xc0 | (unit >> 6) as u8 & 0x1f);
                buf.put_u8(0x80 | unit as u8 & 0x3f);
            },
            _ => {
                buf.put_u8(0xe0 | (unit >> 12) as u8 & 0x0f);
                buf.put_u8(0x80 | (unit >> 6) as u8 & 0x3f);
                buf.put_u8(0x80 | unit as u8 & 0x3f);
            },
        }
    }
}

fn put_string_list(buf: &mut BytesMut, list: &[String]) {
    debug_assert!(list.len() <= i32::MAX as usize);
    buf.put_i32(list.len() as i32);
    for item in list {
        put_string(buf, item);
    }
}

fn put_string_map(buf: &mut BytesMut, map: &[(String, String)]) {
    debug_assert!(map.len() <= i32::MAX as usize);
    buf.put_i32(map.len() as i32);
    for (key, value) in map {
        put_string(buf, key);
        put_string(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(message: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf);
        buf.to_vec()
    }

    async fn decoded(bytes: &[u8]) -> Result<Option<Message>, DecodeError> {
        let mut reader = bytes;
        read_message(&mut reader).await
    }

    #[test]
    fn string_counts_utf16_units_and_uses_modified_utf8() {
        // "a\0β中": 1-byte, overlong NUL, 2-byte, 3-byte.
        let bytes = encoded(&Message::log("a\u{0}β中"));
        assert_eq!(bytes[0], Message::BUILD_LOG_MESSAGE);
        assert_eq!(&bytes[1..5], &4i32.to_be_bytes());
        assert_eq!(&bytes[5..], &[0x61, 0xc0, 0x80, 0xce, 0xb2, 0xe4, 0xb8, 0xad]);
    }

    #[test]
    fn null_string_is_minus_one_with_no_body() {
        let bytes = encoded(&Message::input_eof());
        assert_eq!(bytes, [Message::INPUT_DATA, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn supplementary_chars_travel_as_surrogate_pairs() {
        // U+1F600 is two UTF-16 units, hence two 3-byte sequences.
        let bytes = encoded(&Message::log("\u{1F600}"));
        assert_eq!(&bytes[1..5], &2i32.to_be_bytes());
        assert_eq!(bytes.len(), 1 + 4 + 6);
    }

    #[tokio::test]
    async fn round_trips_preserve_structure() {
        let samples = [
            Message::BuildRequest {
                args: vec!["install".into(), "-DskipTests".into()],
                working_dir: "/work".into(),
                project_dir: "/work/app".into(),
                env: vec![("PATH".into(), "/bin".into()), ("LANG".into(), "C.UTF-8".into())],
            },
            Message::BuildStarted {
                project_id: "app".into(),
                project_count: 12,
                max_threads: 4,
                artifact_id_display_length: 20,
            },
            Message::Prompt {
                project_id: "app".into(),
                uid: "u-1".into(),
                message: "Passphrase:".into(),
                password: true,
            },
            Message::KeepAlive,
            Message::Stop,
            Message::CancelBuild,
            Message::keyboard_input('+'),
            Message::input_eof(),
        ];
        for message in samples {
            let bytes = encoded(&message);
            let back = decoded(&bytes).await.unwrap().unwrap();
            assert_eq!(back, message);
        }
    }

    #[tokio::test]
    async fn map_order_survives_the_wire() {
        let env = vec![
            ("Z".to_string(), "1".to_string()),
            ("A".to_string(), "2".to_string()),
            ("M".to_string(), "3".to_string()),
        ];
        let message = Message::BuildRequest {
            args: vec![],
            working_dir: String::new(),
            project_dir: String::new(),
            env: env.clone(),
        };
        match decoded(&encoded(&message)).await.unwrap().unwrap() {
            Message::BuildRequest { env: back, .. } => assert_eq!(back, env),
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        assert!(decoded(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_record_fails() {
        let mut bytes = encoded(&Message::log("hello"));
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decoded(&bytes).await, Err(DecodeError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn unknown_tag_fails() {
        assert!(matches!(decoded(&[0x63]).await, Err(DecodeError::UnknownTag(0x63))));
    }

    #[tokio::test]
    async fn bad_continuation_byte_fails() {
        // length 1, leading 0xC2 followed by a non-continuation byte
        let bytes = [Message::BUILD_LOG_MESSAGE, 0, 0, 0, 1, 0xc2, 0x41];
        assert!(matches!(decoded(&bytes).await, Err(DecodeError::Malformed(_))));
    }

    #[tokio::test]
    async fn stray_continuation_byte_fails() {
        let bytes = [Message::BUILD_LOG_MESSAGE, 0, 0, 0, 1, 0x80];
        assert!(matches!(decoded(&bytes).await, Err(DecodeError::Malformed(_))));
    }

    #[tokio::test]
    async fn back_to_back_records_share_the_stream() {
        let mut buf = BytesMut::new();
        encode_message(&Message::project_started("a"), &mut buf);
        encode_message(&Message::project_log("a", "line"), &mut buf);
        encode_message(&Message::Stop, &mut buf);

        let mut reader = &buf[..];
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(Message::project_started("a")));
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::project_log("a", "line"))
        );
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(Message::Stop));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }
}
