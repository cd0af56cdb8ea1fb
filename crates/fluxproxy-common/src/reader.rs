//! 可重读的写入数据读取器
//!
//! PointsReader 持有一块不可变的共享缓冲区以及若干 (start, end) 字节区间,
//! 读取时按区间顺序输出,直到真正需要连续内存时才拷贝。
//! 重试时通过 `seek_zero` 回到起点,`copy` 得到共享缓冲区但游标独立的副本。

use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

use crate::error::{CommonError, CommonResult};

/// 可重读的字节读取器
pub trait CopyReader: Read + Send {
    /// 将读取位置重置到起点
    fn seek_zero(&mut self);

    /// 数据点数量
    fn point_count(&self) -> usize;

    /// 读取剩余全部数据
    fn read_remaining(&mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// 基于区间索引的数据点读取器
#[derive(Debug, Clone, Default)]
pub struct PointsReader {
    data: Bytes,
    ranges: Vec<(usize, usize)>,
    /// 当前区间下标
    index: usize,
    /// 当前区间内偏移
    offset: usize,
}

impl PointsReader {
    /// 创建空区间的读取器
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            ranges: Vec::new(),
            index: 0,
            offset: 0,
        }
    }

    /// 以整块数据作为单一区间创建读取器
    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len();
        let mut reader = Self::new(data);
        if len > 0 {
            reader.ranges.push((0, len));
        }
        reader
    }

    /// # Brief
    /// 追加一个字节区间
    ///
    /// # Arguments
    /// * `start` - 起始偏移(包含)
    /// * `end` - 结束偏移(不包含)
    pub fn append_index(&mut self, start: usize, end: usize) -> CommonResult<()> {
        if start > end || end > self.data.len() {
            return Err(CommonError::Deserialization(format!(
                "range [{}, {}) out of buffer length {}",
                start,
                end,
                self.data.len()
            )));
        }
        self.ranges.push((start, end));
        Ok(())
    }

    /// 共享底层缓冲区,游标重置的副本
    pub fn copy(&self) -> Self {
        Self {
            data: self.data.clone(),
            ranges: self.ranges.clone(),
            index: 0,
            offset: 0,
        }
    }

    /// 全部区间的字节总数
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// 按区间顺序拼接出完整数据,不影响游标
    ///
    /// 单一区间时直接返回共享切片。
    pub fn to_bytes(&self) -> Bytes {
        match self.ranges.as_slice() {
            [] => Bytes::new(),
            [(start, end)] => self.data.slice(*start..*end),
            ranges => {
                let mut buf = BytesMut::with_capacity(self.len());
                for (start, end) in ranges {
                    buf.extend_from_slice(&self.data[*start..*end]);
                }
                buf.freeze()
            }
        }
    }
}

impl Read for PointsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.index < self.ranges.len() {
            let (start, end) = self.ranges[self.index];
            let pos = start + self.offset;
            if pos >= end {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = (end - pos).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.data[pos..pos + n]);
            written += n;
            self.offset += n;
        }
        Ok(written)
    }
}

impl CopyReader for PointsReader {
    fn seek_zero(&mut self) {
        self.index = 0;
        self.offset = 0;
    }

    fn point_count(&self) -> usize {
        self.ranges.len()
    }

    fn read_remaining(&mut self) -> io::Result<Bytes> {
        if self.index == 0 && self.offset == 0 {
            let out = self.to_bytes();
            self.index = self.ranges.len();
            return Ok(out);
        }
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}
