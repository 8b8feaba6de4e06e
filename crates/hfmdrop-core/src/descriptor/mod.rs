//! 传输描述文件
//!
//! 为本地文件构建可分发的元数据（单文件清单、分片哈希、私有标记、创建者），
//! 并提供编解码与内容 ID 计算。
//!
//! # 格式
//!
//! ```text
//! d
//!   10:created by 8:HFM Drop
//!   4:info d
//!     6:length i<字节数>e
//!     4:name <文件名>
//!     12:piece length i<分片大小>e
//!     6:pieces <每片 32 字节 SHA-256 拼接>
//!     7:private i1e
//!   e
//! e
//! ```
//!
//! 内容 ID 是 info 字典编码后的 SHA-256（小写十六进制）。

pub mod bencode;
pub mod locator;

pub use bencode::{BencodeError, Value};
pub use locator::{Locator, format_locator, parse_locator};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// 最小分片大小 16 KiB
pub const MIN_PIECE_SIZE: u32 = 16 * 1024;
/// 最大分片大小 16 MiB
pub const MAX_PIECE_SIZE: u32 = 16 * 1024 * 1024;

/// 默认创建者标签
pub const DEFAULT_CREATOR: &str = "HFM Drop";

const PIECE_HASH_LEN: usize = 32;

/// 描述文件错误
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Source file does not exist: {0}")]
    Missing(PathBuf),

    #[error("Source file is not readable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source path has no usable file name: {0}")]
    InvalidName(PathBuf),

    #[error("Invalid piece size {0}: must be a power of two within 16 KiB..=16 MiB")]
    InvalidPieceSize(u32),

    #[error("Failed to write descriptor artifact: {0}")]
    Artifact(#[source] std::io::Error),

    #[error("Malformed descriptor: {0}")]
    Decode(#[from] BencodeError),

    #[error("Descriptor field missing or invalid: {0}")]
    InvalidField(&'static str),
}

/// 分片大小策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceSize {
    /// 根据文件大小自动选择
    #[default]
    Auto,
    /// 固定大小（字节）
    Fixed(u32),
}

impl PieceSize {
    /// 解析为具体的分片大小
    pub fn resolve(self, length: u64) -> Result<u32, DescriptorError> {
        match self {
            PieceSize::Auto => Ok(auto_piece_size(length)),
            PieceSize::Fixed(size) => {
                if size.is_power_of_two() && (MIN_PIECE_SIZE..=MAX_PIECE_SIZE).contains(&size) {
                    Ok(size)
                } else {
                    Err(DescriptorError::InvalidPieceSize(size))
                }
            }
        }
    }
}

/// 自动分片大小: 约 1024 片，取 2 的幂并限制在 16 KiB..=16 MiB
fn auto_piece_size(length: u64) -> u32 {
    let target = (length / 1024).clamp(u64::from(MIN_PIECE_SIZE), u64::from(MAX_PIECE_SIZE));
    let size = target.next_power_of_two().min(u64::from(MAX_PIECE_SIZE));
    u32::try_from(size).unwrap_or(MAX_PIECE_SIZE)
}

/// 单文件描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    pub pieces: Vec<[u8; PIECE_HASH_LEN]>,
    pub private: bool,
    pub created_by: Option<String>,
}

impl Descriptor {
    /// 分片数量
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// 第 `index` 片的字节范围
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * u64::from(self.piece_length);
        let end = (start + u64::from(self.piece_length)).min(self.length);
        Some((start, end))
    }

    /// 校验分片数据
    pub fn verify_piece(&self, index: usize, data: &[u8]) -> bool {
        self.pieces
            .get(index)
            .is_some_and(|expected| hash_piece(data) == *expected)
    }

    fn info_value(&self) -> Value {
        let mut info = BTreeMap::new();
        let length = i64::try_from(self.length).unwrap_or(i64::MAX);
        info.insert(b"length".to_vec(), Value::Int(length));
        info.insert(b"name".to_vec(), Value::from(self.name.as_str()));
        info.insert(
            b"piece length".to_vec(),
            Value::Int(i64::from(self.piece_length)),
        );
        info.insert(b"pieces".to_vec(), Value::Bytes(self.pieces.concat()));
        if self.private {
            info.insert(b"private".to_vec(), Value::Int(1));
        }
        Value::Dict(info)
    }

    /// 内容 ID: info 字典的 SHA-256
    pub fn content_id(&self) -> String {
        let digest = Sha256::digest(self.info_value().encode());
        hex::encode(digest)
    }

    /// 定位串
    pub fn locator(&self) -> String {
        format_locator(&self.content_id(), &self.name)
    }

    /// 编码
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = BTreeMap::new();
        if let Some(creator) = &self.created_by {
            root.insert(b"created by".to_vec(), Value::from(creator.as_str()));
        }
        root.insert(b"info".to_vec(), self.info_value());
        Value::Dict(root).encode()
    }

    /// 解码
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let root = bencode::decode(bytes)?;
        let info = root.get("info").ok_or(DescriptorError::InvalidField("info"))?;

        let name = info
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| is_plain_file_name(n))
            .ok_or(DescriptorError::InvalidField("name"))?
            .to_string();
        let length = info
            .get("length")
            .and_then(Value::as_int)
            .and_then(|l| u64::try_from(l).ok())
            .ok_or(DescriptorError::InvalidField("length"))?;
        let piece_length = info
            .get("piece length")
            .and_then(Value::as_int)
            .and_then(|l| u32::try_from(l).ok())
            .filter(|l| *l > 0)
            .ok_or(DescriptorError::InvalidField("piece length"))?;
        let raw_pieces = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .filter(|p| p.len() % PIECE_HASH_LEN == 0)
            .ok_or(DescriptorError::InvalidField("pieces"))?;
        let pieces: Vec<[u8; PIECE_HASH_LEN]> = raw_pieces
            .chunks_exact(PIECE_HASH_LEN)
            .filter_map(|c| c.try_into().ok())
            .collect();
        if pieces.len() as u64 != length.div_ceil(u64::from(piece_length)) {
            return Err(DescriptorError::InvalidField("pieces"));
        }
        let private = info.get("private").and_then(Value::as_int) == Some(1);
        let created_by = root
            .get("created by")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            name,
            length,
            piece_length,
            pieces,
            private,
            created_by,
        })
    }

    /// 从磁盘读取
    pub fn read_from(path: &Path) -> Result<Self, DescriptorError> {
        let bytes = std::fs::read(path).map_err(|source| DescriptorError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }
}

/// 文件名不能包含路径分隔符，防止写出保存目录
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// 分片哈希 (SHA-256)
pub fn hash_piece(data: &[u8]) -> [u8; PIECE_HASH_LEN] {
    Sha256::digest(data).into()
}

/// 构建完成的描述
///
/// `artifact` 是源文件旁的临时描述文件，随本结构体一起释放（删除）。
pub struct BuiltDescriptor {
    pub descriptor: Descriptor,
    pub bytes: Vec<u8>,
    artifact: TempPath,
}

impl BuiltDescriptor {
    /// 临时描述文件路径
    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    /// 立即删除临时描述文件
    pub fn discard(self) {
        let path = self.artifact.to_path_buf();
        if let Err(e) = self.artifact.close() {
            warn!("Failed to delete descriptor artifact {:?}: {}", path, e);
        } else {
            debug!("Deleted descriptor artifact {:?}", path);
        }
    }
}

/// 描述文件构建器
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    piece_size: PieceSize,
    private: bool,
    creator: String,
}

impl Default for DescriptorBuilder {
    fn default() -> Self {
        Self {
            piece_size: PieceSize::Auto,
            private: true,
            creator: DEFAULT_CREATOR.to_string(),
        }
    }
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_piece_size(mut self, piece_size: PieceSize) -> Self {
        self.piece_size = piece_size;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// 只计算描述，不写临时文件
    pub fn describe(&self, source: &Path) -> Result<Descriptor, DescriptorError> {
        if !source.is_file() {
            return Err(DescriptorError::Missing(source.to_path_buf()));
        }
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| is_plain_file_name(n))
            .ok_or_else(|| DescriptorError::InvalidName(source.to_path_buf()))?
            .to_string();

        let unreadable = |source_err| DescriptorError::Unreadable {
            path: source.to_path_buf(),
            source: source_err,
        };
        let file = File::open(source).map_err(unreadable)?;
        let length = file.metadata().map_err(unreadable)?.len();
        let piece_length = self.piece_size.resolve(length)?;

        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; piece_length as usize];
        let piece_count = usize::try_from(length.div_ceil(u64::from(piece_length))).unwrap_or(0);
        let mut pieces = Vec::with_capacity(piece_count);
        let mut total = 0u64;
        loop {
            let n = read_full(&mut reader, &mut buf).map_err(unreadable)?;
            if n == 0 {
                break;
            }
            pieces.push(hash_piece(&buf[..n]));
            total += n as u64;
        }
        if total != length {
            // 读取期间文件被修改
            return Err(unreadable(std::io::Error::other(format!(
                "length changed while hashing ({length} -> {total})"
            ))));
        }

        Ok(Descriptor {
            name,
            length,
            piece_length,
            pieces,
            private: self.private,
            created_by: Some(self.creator.clone()),
        })
    }

    /// 构建描述并写入源文件旁的临时描述文件
    pub fn build(&self, source: &Path) -> Result<BuiltDescriptor, DescriptorError> {
        let descriptor = self.describe(source)?;
        let bytes = descriptor.to_bytes();

        let dir = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::Builder::new()
            .prefix("seed_")
            .suffix(".torrent")
            .tempfile_in(dir)
            .map_err(DescriptorError::Artifact)?;
        file.write_all(&bytes).map_err(DescriptorError::Artifact)?;
        file.flush().map_err(DescriptorError::Artifact)?;
        let artifact = file.into_temp_path();

        debug!(
            "Built descriptor for {:?}: {} bytes, {} pieces of {}",
            source,
            descriptor.length,
            descriptor.piece_count(),
            descriptor.piece_length
        );

        Ok(BuiltDescriptor {
            descriptor,
            bytes,
            artifact,
        })
    }
}

/// 尽量读满缓冲区，返回实际读取字节数（0 表示 EOF）
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
