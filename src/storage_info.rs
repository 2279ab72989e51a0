//! Storage layout and the piece-to-file mapper (spec.md §4.7, §8 S4/S5).

use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    torrent::Torrent,
    FileIndex, PieceIndex,
};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path on disk, including the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. Always 0 for a
    /// single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }
}

/// One write to perform as part of placing a downloaded piece on disk
/// (spec.md §4.7): `len` bytes starting at `piece_offset` within the
/// piece's contiguous buffer go to `file_offset` within the file at
/// `file_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileWrite {
    pub file_index: FileIndex,
    pub file_offset: u64,
    pub piece_offset: usize,
    pub len: usize,
}

/// Information about a torrent's storage details: the piece count and
/// length, download length, and file layout.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    pub piece_count: usize,
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length (spec.md §8 S5).
    pub last_piece_len: u32,
    pub download_len: u64,
    /// The download destination directory: for a single file download, the
    /// directory the file is placed in; for a multi-file (archive) download,
    /// this directory joined by the torrent's name, so that a torrent with
    /// multiple top-level entries downloads into its own subdirectory rather
    /// than scattering files across the download directory.
    pub download_dir: PathBuf,
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Extracts storage related information from a resolved torrent,
    /// applying the path hygiene rules of spec.md §4.7 to every path
    /// segment of a multi-file layout.
    pub fn new(torrent: &Torrent, download_dir: PathBuf) -> Result<Self> {
        let piece_count = torrent.piece_count();
        if piece_count == 0 {
            return Err(Error::InvalidMetainfo("torrent has no pieces".into()));
        }
        let download_len = torrent.total_length;
        let piece_len = torrent.piece_length;
        let full_pieces_len = piece_len as u64 * (piece_count as u64 - 1);
        if full_pieces_len > download_len {
            return Err(Error::InvalidMetainfo(
                "piece_length * (piece_count - 1) exceeds total_length".into(),
            ));
        }
        let last_piece_len = (download_len - full_pieces_len) as u32;

        let is_archive = !torrent.files.is_empty();
        let structure = if is_archive {
            let mut offset = 0u64;
            let mut files = Vec::with_capacity(torrent.files.len());
            let root = download_dir.join(sanitize_segment(&torrent.name, 255));
            for entry in &torrent.files {
                let mut path = root.clone();
                for segment in &entry.path_segments {
                    path.push(sanitize_segment(segment, 255));
                }
                files.push(FileInfo { path, len: entry.length, torrent_offset: offset });
                offset += entry.length;
            }
            FsStructure::Archive { files }
        } else {
            let path = download_dir.join(sanitize_segment(&torrent.name, 255));
            FsStructure::File(FileInfo { path, len: download_len, torrent_offset: 0 })
        };

        let download_dir =
            if is_archive { download_dir.join(sanitize_segment(&torrent.name, 255)) } else { download_dir };

        Ok(Self { piece_count, piece_len, last_piece_len, download_len, download_dir, structure })
    }

    pub fn files(&self) -> &[FileInfo] {
        match &self.structure {
            FsStructure::File(file) => std::slice::from_ref(file),
            FsStructure::Archive { files } => files,
        }
    }

    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the zero-based indices of the files that intersect the given
    /// piece.
    pub fn files_intersecting_piece(&self, index: PieceIndex) -> Result<Range<FileIndex>> {
        let piece_offset = index as u64 * self.piece_len as u64;
        let piece_end = piece_offset + self.piece_len(index)? as u64;
        Ok(self.structure.files_intersecting_bytes(piece_offset..piece_end))
    }

    /// Computes the full write plan for a piece: for each file the piece
    /// overlaps, the slice of the piece's contiguous buffer and the file
    /// offset it must be written to (spec.md §4.7).
    pub fn write_plan(&self, index: PieceIndex) -> Result<Vec<FileWrite>> {
        let piece_start = index as u64 * self.piece_len as u64;
        let piece_end = piece_start + self.piece_len(index)? as u64;
        let file_range = self.files_intersecting_piece(index)?;

        let mut plan = Vec::with_capacity(file_range.len().max(1));
        for file_index in file_range {
            let file = &self.files()[file_index];
            let write_start = piece_start.max(file.torrent_offset);
            let write_end = piece_end.min(file.torrent_end_offset());
            debug_assert!(write_end > write_start);
            plan.push(FileWrite {
                file_index,
                file_offset: write_start - file.torrent_offset,
                piece_offset: (write_start - piece_start) as usize,
                len: (write_end - write_start) as usize,
            });
        }
        Ok(plan)
    }
}

/// Defines the file system structure of the download.
#[derive(Clone, Debug)]
pub(crate) enum FsStructure {
    File(FileInfo),
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    pub fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Returns the files that overlap with the given left-inclusive range of
    /// bytes, where `bytes.start` is the offset and `bytes.end` is one past
    /// the last byte offset.
    pub fn files_intersecting_bytes(&self, byte_range: Range<u64>) -> Range<FileIndex> {
        match self {
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                let first_matching_index = match files
                    .iter()
                    .enumerate()
                    .find(|(_, file)| file.byte_range().contains(&byte_range.start))
                    .map(|(index, _)| index)
                {
                    Some(index) => index,
                    None => return 0..0,
                };

                let mut file_range = first_matching_index..first_matching_index + 1;
                for (index, file) in files.iter().enumerate().skip(first_matching_index + 1) {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    file_range.end = index + 1;
                }
                file_range
            }
        }
    }
}

/// Applies spec.md §4.7's path hygiene rules to a single path segment:
/// (a) invalid UTF-8 is replaced with the Unicode replacement character --
/// handled implicitly by `String::from_utf8_lossy` at the metainfo-parsing
/// boundary, so by the time a segment reaches here it is always valid UTF-8
/// already; (b) the segment is trimmed to `max_bytes` while preserving a
/// file extension suffix when possible; (c) any `/` within the segment is
/// replaced with `_`, since `/` would otherwise be interpreted as a path
/// separator and let a malicious torrent escape the download directory.
fn sanitize_segment(segment: &str, max_bytes: usize) -> String {
    let segment = segment.replace('/', "_");
    truncate_preserving_extension(segment, max_bytes)
}

fn truncate_preserving_extension(segment: String, max_bytes: usize) -> String {
    if segment.len() <= max_bytes {
        return segment;
    }
    let (stem, ext) = match segment.rfind('.') {
        Some(pos) if pos > 0 => (segment[..pos].to_string(), segment[pos..].to_string()),
        _ => (segment, String::new()),
    };
    let budget = max_bytes.saturating_sub(ext.len());
    let mut stem_bytes = stem.into_bytes();
    stem_bytes.truncate(budget);
    while std::str::from_utf8(&stem_bytes).is_err() {
        stem_bytes.pop();
    }
    let mut result = String::from_utf8(stem_bytes).expect("truncated at a char boundary");
    result.push_str(&ext);
    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::torrent::FileEntry;

    fn torrent_with(
        piece_length: u32,
        total_length: u64,
        files: Vec<FileEntry>,
        name: &str,
    ) -> Torrent {
        let piece_count = ((total_length + piece_length as u64 - 1) / piece_length as u64).max(1);
        Torrent {
            info_hash: [0; 20],
            piece_length,
            piece_hashes: vec![[0; 20]; piece_count as usize],
            total_length,
            name: name.into(),
            files,
            announce: "udp://tr".into(),
            peer_id: [0; 20],
        }
    }

    #[test]
    fn single_file_piece_lands_at_index_times_piece_length() {
        // S3-adjacent scenario: §8 S3 covers a single-file torrent's output
        // file size and piece offsets
        let torrent = torrent_with(16, 40, Vec::new(), "movie.mkv");
        let info = StorageInfo::new(&torrent, PathBuf::from("/out")).unwrap();
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.last_piece_len, 8);
        assert_eq!(info.files()[0].len, 40);

        let plan = info.write_plan(1).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].file_offset, 16);
        assert_eq!(plan[0].len, 16);
    }

    #[test]
    fn last_piece_length_is_the_remainder_not_the_nominal_length() {
        // spec.md §8 S5
        let torrent = torrent_with(16, 40, Vec::new(), "x");
        let info = StorageInfo::new(&torrent, PathBuf::from("/out")).unwrap();
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.last_piece_len, 8);
        assert_ne!(info.last_piece_len, info.piece_len);
    }

    #[test]
    fn multi_file_piece_write_plan_splits_across_files() {
        // spec.md §8 S4: piece_length=16, files A:10, B:30; piece 0 writes
        // bytes 0..10 of A at offset 0 and bytes 0..6 of B at offset 0
        let torrent = torrent_with(
            16,
            40,
            vec![
                FileEntry { length: 10, path_segments: vec!["a.bin".into()] },
                FileEntry { length: 30, path_segments: vec!["b.bin".into()] },
            ],
            "multi",
        );
        let info = StorageInfo::new(&torrent, PathBuf::from("/out")).unwrap();
        assert!(info.download_dir.ends_with("multi"));

        let plan = info.write_plan(0).unwrap();
        assert_eq!(
            plan,
            vec![
                FileWrite { file_index: 0, file_offset: 0, piece_offset: 0, len: 10 },
                FileWrite { file_index: 1, file_offset: 0, piece_offset: 10, len: 6 },
            ]
        );

        // the sum of written ranges per piece equals the piece length
        let total: usize = plan.iter().map(|w| w.len).sum();
        assert_eq!(total, info.piece_len(0).unwrap() as usize);
    }

    #[test]
    fn write_plans_cover_every_piece_with_no_overlap_and_no_gaps() {
        let torrent = torrent_with(
            16,
            71,
            vec![
                FileEntry { length: 9, path_segments: vec!["0".into()] },
                FileEntry { length: 11, path_segments: vec!["1".into()] },
                FileEntry { length: 7, path_segments: vec!["2".into()] },
                FileEntry { length: 9, path_segments: vec!["3".into()] },
                FileEntry { length: 12, path_segments: vec!["4".into()] },
                FileEntry { length: 16, path_segments: vec!["5".into()] },
                FileEntry { length: 8, path_segments: vec!["6".into()] },
            ],
            "archive",
        );
        let info = StorageInfo::new(&torrent, PathBuf::from("/out")).unwrap();
        let mut covered = vec![false; 71];
        for piece in 0..info.piece_count {
            let piece_start = piece as u64 * 16;
            for write in info.write_plan(piece).unwrap() {
                let file = &info.files()[write.file_index];
                let global_start = file.torrent_offset + write.file_offset;
                for i in 0..write.len as u64 {
                    let pos = (global_start + i) as usize;
                    assert!(!covered[pos], "byte {} written twice", pos);
                    covered[pos] = true;
                }
                assert_eq!(piece_start + write.piece_offset as u64, global_start);
            }
        }
        assert!(covered.iter().all(|&b| b), "every byte must be covered");
    }

    #[test]
    fn sanitize_segment_replaces_path_separators() {
        assert_eq!(sanitize_segment("a/b", 255), "a_b");
    }

    #[test]
    fn sanitize_segment_truncates_preserving_extension() {
        let long_stem = "a".repeat(300);
        let segment = format!("{}.txt", long_stem);
        let sanitized = sanitize_segment(&segment, 255);
        assert!(sanitized.len() <= 255);
        assert!(sanitized.ends_with(".txt"));
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: 12341234,
        });
        assert_eq!(structure.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..12341234), 0..1);

        let structure = FsStructure::Archive {
            files: vec![
                FileInfo { path: PathBuf::from("/0"), torrent_offset: 0, len: 4 },
                FileInfo { path: PathBuf::from("/1"), torrent_offset: 4, len: 9 },
                FileInfo { path: PathBuf::from("/2"), torrent_offset: 13, len: 3 },
                FileInfo { path: PathBuf::from("/3"), torrent_offset: 16, len: 10 },
            ],
        };
        assert_eq!(structure.files_intersecting_bytes(0..4), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..5), 0..2);
        assert_eq!(structure.files_intersecting_bytes(0..18), 0..4);
        assert_eq!(structure.files_intersecting_bytes(25..26), 3..4);
        assert_eq!(structure.files_intersecting_bytes(30..38), 0..0);
    }
}
