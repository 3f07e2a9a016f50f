//! Implementation of the Git smart protocol state machine: reference advertisement,
//! upload-pack negotiation and pack transfer, receive-pack command processing and status
//! reports, over both stateless (HTTP) and connection-oriented (SSH) exchanges.

use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    core::RepositoryAccess,
    pack::PackGenerator,
    types::{
        AGENT, Capability, CommandType, LF, NUL, PKT_LINE_END_MARKER, ProtocolError,
        ProtocolStream, RECEIVE_CAP_LIST, RefCommand, SIDE_BAND_64K_DATA, SIDE_BAND_DATA, SP,
        Service, SideBand, TransportProtocol, UPLOAD_CAP_LIST,
    },
    utils::{
        PktLine, add_flush, add_pkt_line_string, build_smart_reply, read_pkt_line,
        read_pkt_line_async, read_until_white_space, side_band_frames,
    },
};
use crate::{
    hash::ObjectHash,
    internal::{object::types::ObjectType, pack::PackScanner},
    storage::{
        ReferenceTarget, StorageError,
        types::{HEAD, validate_reference_name},
    },
};

const PACK_READ_CHUNK: usize = 64 * 1024;
/// Annotated tags pointing at annotated tags are peeled at most this deep.
const MAX_PEEL_DEPTH: usize = 8;

/// Smart Git Protocol implementation
///
/// This struct handles the Git smart protocol operations for both HTTP and SSH transports.
/// Capabilities and commands are per exchange and reset whenever a new request is parsed.
pub struct SmartProtocol<R>
where
    R: RepositoryAccess,
{
    pub transport_protocol: TransportProtocol,
    pub capabilities: Vec<Capability>,
    pub command_list: Vec<RefCommand>,
    repo_storage: R,
}

/// Have-processing without multi_ack: only the first common object is acknowledged.
#[derive(Debug, Default)]
struct Negotiation {
    common: Vec<ObjectHash>,
}

impl Negotiation {
    async fn have<R: RepositoryAccess>(
        &mut self,
        repo: &R,
        hash: ObjectHash,
        out: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if self.common.contains(&hash) || !repo.has_object(&hash).await? {
            return Ok(());
        }
        self.common.push(hash);
        if self.common.len() == 1 {
            add_pkt_line_string(out, format!("ACK {hash}\n"));
        }
        Ok(())
    }

    fn flush(&self, out: &mut BytesMut) {
        if self.common.is_empty() {
            add_pkt_line_string(out, String::from("NAK\n"));
        }
    }

    fn done(&self, out: &mut BytesMut) {
        self.flush(out);
    }
}

/// What a negotiation line asks for.
enum NegotiationLine {
    Have(ObjectHash),
    Done,
    Other(String),
}

impl<R> SmartProtocol<R>
where
    R: RepositoryAccess,
{
    /// Create a new SmartProtocol instance
    pub fn new(transport_protocol: TransportProtocol, repo_storage: R) -> Self {
        Self {
            transport_protocol,
            capabilities: Vec::new(),
            command_list: Vec::new(),
            repo_storage,
        }
    }

    /// Get git info refs for the repository, with explicit service type
    pub async fn git_info_refs(&self, service: Service) -> Result<BytesMut, ProtocolError> {
        let refs = self.repo_storage.get_repository_refs().await?;

        let mut head_hash = None;
        let mut symref = None;
        let mut advertised: Vec<(ObjectHash, String)> = Vec::new();
        for reference in refs {
            let hash = match &reference.target {
                ReferenceTarget::Direct(hash) => Some(*hash),
                ReferenceTarget::Symbolic(_) => self.repo_storage.resolve(&reference.name).await?,
            };
            if reference.name == HEAD {
                if let (ReferenceTarget::Symbolic(target), Some(_)) = (&reference.target, hash) {
                    symref = Some(target.clone());
                }
                head_hash = hash;
                continue;
            }
            let Some(hash) = hash else {
                continue;
            };
            advertised.push((hash, reference.name.clone()));
            if reference.name.starts_with("refs/tags/") {
                if let Some(peeled) = self.peel_tag(hash).await? {
                    advertised.push((peeled, format!("{}^{{}}", reference.name)));
                }
            }
        }

        let base_caps = match service {
            Service::UploadPack => UPLOAD_CAP_LIST,
            Service::ReceivePack => RECEIVE_CAP_LIST,
        };
        let mut cap_list = format!("{base_caps} agent={AGENT} object-format=sha1");
        if let Some(target) = symref {
            cap_list.push_str(&format!(" symref=HEAD:{target}"));
        }

        // The first line carries the capabilities behind a NUL.
        let mut ref_list = Vec::with_capacity(advertised.len() + 1);
        let mut rest = advertised.into_iter();
        match head_hash {
            Some(hash) => ref_list.push(format!("{hash}{SP}{HEAD}{NUL}{cap_list}{LF}")),
            None => match rest.next() {
                Some((hash, name)) => ref_list.push(format!("{hash}{SP}{name}{NUL}{cap_list}{LF}")),
                None => ref_list.push(format!(
                    "{}{SP}capabilities^{{}}{NUL}{cap_list}{LF}",
                    ObjectHash::zero_str()
                )),
            },
        }
        ref_list.extend(rest.map(|(hash, name)| format!("{hash}{SP}{name}{LF}")));

        let pkt_line_stream =
            build_smart_reply(self.transport_protocol, &ref_list, service.to_string());
        tracing::debug!(%service, refs = ref_list.len(), "advertised references");
        Ok(pkt_line_stream)
    }

    /// Object an annotated tag finally points at; `None` when `hash` is not a tag object.
    async fn peel_tag(&self, hash: ObjectHash) -> Result<Option<ObjectHash>, ProtocolError> {
        let mut current = hash;
        let mut peeled = None;
        for _ in 0..MAX_PEEL_DEPTH {
            let object = match self.repo_storage.get_object(&current).await {
                Ok(object) => object,
                Err(ProtocolError::Storage(StorageError::NotFound(_))) => break,
                Err(e) => return Err(e),
            };
            if object.obj_type != ObjectType::Tag {
                break;
            }
            let tag = self.repo_storage.get_tag(&current).await?;
            current = tag.object_hash;
            peeled = Some(current);
        }
        Ok(peeled)
    }

    /// Handle a stateless git-upload-pack request (HTTP).
    ///
    /// A request without wants yields an empty stream. A request ending in a flush without
    /// `done` yields only the ACK/NAK lines.
    pub async fn git_upload_pack(
        &mut self,
        upload_request: Bytes,
    ) -> Result<ProtocolStream, ProtocolError> {
        self.capabilities.clear();
        let mut upload_request = upload_request;

        let mut wants = Vec::new();
        loop {
            match read_pkt_line(&mut upload_request) {
                Ok(Some(PktLine::Data(line))) => {
                    if let Some(want) = self.parse_want_line(line, wants.is_empty())? {
                        wants.push(want);
                    }
                }
                Ok(Some(PktLine::Flush)) => break,
                Ok(None) => break,
                // A body cut short before any want asks for nothing.
                Err(ProtocolError::Decode(_)) if wants.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        if wants.is_empty() {
            tracing::debug!("upload-pack request without wants");
            return Ok(Box::pin(stream::empty::<Result<Bytes, ProtocolError>>()));
        }
        self.check_wants(&wants).await?;

        let mut negotiation = Negotiation::default();
        let mut protocol_buf = BytesMut::new();
        loop {
            match read_pkt_line(&mut upload_request)? {
                None => break,
                Some(PktLine::Flush) => {
                    negotiation.flush(&mut protocol_buf);
                    return Ok(once_stream(protocol_buf.freeze()));
                }
                Some(PktLine::Data(line)) => match parse_negotiation_line(line)? {
                    NegotiationLine::Have(hash) => {
                        negotiation
                            .have(&self.repo_storage, hash, &mut protocol_buf)
                            .await?
                    }
                    NegotiationLine::Done => {
                        negotiation.done(&mut protocol_buf);
                        let pack = self.prepare_pack(&wants, &negotiation.common).await?;
                        return Ok(self.pack_response(protocol_buf, pack));
                    }
                    NegotiationLine::Other(command) => {
                        tracing::warn!(%command, "unknown upload-pack command");
                    }
                },
            }
        }
        Ok(once_stream(protocol_buf.freeze()))
    }

    /// Handle a stateless git-receive-pack request (HTTP): commands, flush, pack.
    pub async fn git_receive_pack_stream(
        &mut self,
        data_stream: ProtocolStream,
    ) -> Result<Bytes, ProtocolError> {
        let mut request_data = BytesMut::new();
        let mut stream = data_stream;
        while let Some(chunk) = stream.next().await {
            request_data.extend_from_slice(&chunk?);
        }

        let mut protocol_bytes = request_data.freeze();
        self.command_list.clear();
        self.capabilities.clear();
        let mut saw_flush = false;
        while let Some(pkt_line) = read_pkt_line(&mut protocol_bytes)? {
            match pkt_line {
                PktLine::Flush => {
                    saw_flush = true;
                    break;
                }
                PktLine::Data(line) => self.parse_command_line(line)?,
            }
        }

        if self.command_list.is_empty() {
            return Ok(Bytes::new());
        }
        if !saw_flush {
            return Err(ProtocolError::decode("missing flush after push commands"));
        }

        // Remaining bytes (if any) are pack data.
        let pack_data = (!protocol_bytes.is_empty()).then_some(protocol_bytes);
        Ok(self.apply_push(pack_data).await?.freeze())
    }

    /// Connection-oriented upload-pack: advertisement, stateful negotiation, pack.
    pub async fn serve_upload_pack<Rd, W>(
        &mut self,
        reader: &mut Rd,
        writer: &mut W,
    ) -> Result<(), ProtocolError>
    where
        Rd: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let advertisement = self.git_info_refs(Service::UploadPack).await?;
        writer.write_all(&advertisement).await?;
        writer.flush().await?;

        self.capabilities.clear();
        let mut wants = Vec::new();
        loop {
            match read_pkt_line_async(reader).await? {
                Some(PktLine::Data(line)) => {
                    if let Some(want) = self.parse_want_line(line, wants.is_empty())? {
                        wants.push(want);
                    }
                }
                Some(PktLine::Flush) => break,
                None if wants.is_empty() => break,
                None => return Err(ProtocolError::decode("connection closed inside want list")),
            }
        }
        if wants.is_empty() {
            tracing::debug!("client requested nothing");
            return Ok(());
        }
        self.check_wants(&wants).await?;

        let mut negotiation = Negotiation::default();
        let mut protocol_buf = BytesMut::new();
        loop {
            match read_pkt_line_async(reader).await? {
                None => return Err(ProtocolError::decode("connection closed before done")),
                Some(PktLine::Flush) => {
                    negotiation.flush(&mut protocol_buf);
                    writer.write_all(&protocol_buf.split()).await?;
                    writer.flush().await?;
                }
                Some(PktLine::Data(line)) => match parse_negotiation_line(line)? {
                    NegotiationLine::Have(hash) => {
                        negotiation
                            .have(&self.repo_storage, hash, &mut protocol_buf)
                            .await?
                    }
                    NegotiationLine::Done => {
                        negotiation.done(&mut protocol_buf);
                        break;
                    }
                    NegotiationLine::Other(command) => {
                        tracing::warn!(%command, "unknown upload-pack command");
                    }
                },
            }
        }
        writer.write_all(&protocol_buf).await?;

        let pack = match self.prepare_pack(&wants, &negotiation.common).await {
            Ok(pack) => pack,
            Err(e) => {
                if self.side_band_limit().is_some() {
                    let message = format!("error: {e}\n");
                    let mut frame = BytesMut::new();
                    add_pkt_line_bytes_on_band(&mut frame, SideBand::Error, message.as_bytes());
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                }
                return Err(e);
            }
        };
        let mut response = self.pack_response(BytesMut::new(), pack);
        while let Some(chunk) = response.next().await {
            writer.write_all(&chunk?).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Connection-oriented receive-pack: advertisement, commands, pack until its trailer,
    /// status report.
    pub async fn serve_receive_pack<Rd, W>(
        &mut self,
        reader: &mut Rd,
        writer: &mut W,
    ) -> Result<(), ProtocolError>
    where
        Rd: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let advertisement = self.git_info_refs(Service::ReceivePack).await?;
        writer.write_all(&advertisement).await?;
        writer.flush().await?;

        self.command_list.clear();
        self.capabilities.clear();
        loop {
            match read_pkt_line_async(reader).await? {
                Some(PktLine::Data(line)) => self.parse_command_line(line)?,
                Some(PktLine::Flush) => break,
                None if self.command_list.is_empty() => break,
                None => return Err(ProtocolError::decode("connection closed inside command list")),
            }
        }
        if self.command_list.is_empty() {
            tracing::debug!("client pushed nothing");
            return Ok(());
        }

        let needs_pack = self
            .command_list
            .iter()
            .any(|c| c.command_type() != CommandType::Delete);
        let pack_data = if needs_pack {
            Some(read_pack(reader).await?)
        } else {
            None
        };

        let report = self.apply_push(pack_data).await?;
        writer.write_all(&report).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Unpacks, applies every command and builds the status report.
    async fn apply_push(&mut self, pack_data: Option<Bytes>) -> Result<BytesMut, ProtocolError> {
        let unpack_result = match pack_data.filter(|data| !data.is_empty()) {
            Some(data) => self.unpack_and_store(&data).await,
            None => Ok(()),
        };

        let mut commands = std::mem::take(&mut self.command_list);
        match &unpack_result {
            Ok(()) => {
                for command in &mut commands {
                    self.apply_command(command).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "push unpack failed");
                for command in &mut commands {
                    command.failed("unpacker error");
                }
            }
        }

        let mut report_status = BytesMut::new();
        match &unpack_result {
            Ok(()) => add_pkt_line_string(&mut report_status, "unpack ok\n".to_owned()),
            Err(e) => add_pkt_line_string(
                &mut report_status,
                format!("unpack {}\n", single_line(&e.to_string())),
            ),
        }
        for command in &commands {
            add_pkt_line_string(&mut report_status, command.get_status());
        }
        add_flush(&mut report_status);

        if let Err(e) = self.repo_storage.post_receive_hook(&commands).await {
            tracing::warn!(error = %e, "post-receive hook failed");
        }
        self.command_list = commands;

        if !self.capabilities.contains(&Capability::ReportStatus) {
            return Ok(BytesMut::new());
        }
        Ok(match self.side_band_limit() {
            Some(max) => {
                let mut framed = side_band_frames(SideBand::PackfileData, &report_status, max);
                add_flush(&mut framed);
                framed
            }
            None => report_status,
        })
    }

    async fn unpack_and_store(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let pack_generator = PackGenerator::new(&self.repo_storage);
        let decoded = pack_generator.unpack(data).await?;
        let stored = pack_generator.store(&decoded).await?;
        tracing::info!(objects = stored, "stored pushed objects");
        Ok(())
    }

    /// Applies one command. Every failure, storage errors included, is recorded in the
    /// command's status so the remaining commands still run and the report still goes out.
    async fn apply_command(&self, command: &mut RefCommand) {
        if command.ref_name == HEAD || validate_reference_name(&command.ref_name).is_err() {
            command.failed("funny refname");
            return;
        }
        let command_type = command.command_type();
        if command_type != CommandType::Delete {
            match self.repo_storage.has_object(&command.new_hash).await {
                Ok(true) => {}
                Ok(false) => {
                    command.failed("missing object");
                    return;
                }
                Err(e) => {
                    tracing::warn!(reference = %command.ref_name, error = %e, "object lookup failed");
                    command.failed(single_line(&e.to_string()));
                    return;
                }
            }
        }

        let old = (!command.old_hash.is_zero()).then_some(command.old_hash);
        let new = (command_type != CommandType::Delete).then_some(command.new_hash);
        match self
            .repo_storage
            .update_reference(&command.ref_name, old, new)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    reference = %command.ref_name,
                    old = %command.old_hash,
                    new = %command.new_hash,
                    "reference updated"
                );
                command.success();
            }
            Err(ProtocolError::Storage(StorageError::ReferenceConflict { .. })) => {
                command.failed("stale old value");
            }
            Err(ProtocolError::Storage(StorageError::NotFound(_))) if old.is_some() => {
                command.failed("stale old value");
            }
            Err(e) => {
                tracing::warn!(reference = %command.ref_name, error = %e, "reference update failed");
                command.failed(single_line(&e.to_string()));
            }
        }
    }

    /// Parses a want-list line; capabilities ride on the first want.
    fn parse_want_line(
        &mut self,
        mut line: Bytes,
        first: bool,
    ) -> Result<Option<ObjectHash>, ProtocolError> {
        let command = read_until_white_space(&mut line);
        match command.as_str() {
            "want" => {
                let hash = parse_hash(&read_until_white_space(&mut line))?;
                if first {
                    self.parse_capabilities(&String::from_utf8_lossy(&line));
                }
                Ok(Some(hash))
            }
            "shallow" | "deepen" | "deepen-since" | "deepen-not" | "filter" => {
                tracing::debug!(%command, "ignoring unsupported fetch option");
                Ok(None)
            }
            _ => Err(ProtocolError::decode(format!(
                "unexpected upload-pack line `{command}`"
            ))),
        }
    }

    async fn check_wants(&self, wants: &[ObjectHash]) -> Result<(), ProtocolError> {
        for want in wants {
            if !self.repo_storage.has_object(want).await? {
                return Err(ProtocolError::invalid_request(format!("not our ref {want}")));
            }
        }
        Ok(())
    }

    /// Parses one `<old> <new> <ref>` line; capabilities follow a NUL on the first one.
    fn parse_command_line(&mut self, line: Bytes) -> Result<(), ProtocolError> {
        let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
        let (command, caps) = match line.iter().position(|b| *b == 0) {
            Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
            None => (line, None),
        };
        if command.starts_with(b"shallow ") {
            return Ok(());
        }
        if let (true, Some(caps)) = (self.command_list.is_empty(), caps) {
            self.parse_capabilities(&String::from_utf8_lossy(caps));
        }

        let text = std::str::from_utf8(command)
            .map_err(|_| ProtocolError::decode("push command is not UTF-8"))?;
        let parts: Vec<&str> = text.split(' ').collect();
        let [old, new, name] = parts.as_slice() else {
            return Err(ProtocolError::decode(format!("malformed push command `{text}`")));
        };
        self.command_list.push(RefCommand::new(
            parse_hash(old)?,
            parse_hash(new)?,
            name.to_string(),
        ));
        Ok(())
    }

    /// Parse capabilities from capability string
    pub fn parse_capabilities(&mut self, cap_str: &str) {
        for cap in cap_str.split_whitespace() {
            if let Ok(capability) = cap.parse::<Capability>() {
                if matches!(&capability, Capability::ObjectFormat(format) if format != "sha1") {
                    tracing::warn!(capability = %capability, "client asked for an unsupported object format");
                }
                self.capabilities.push(capability);
            }
        }
    }

    /// Payload bytes per side-band packet, if the client negotiated side-band.
    fn side_band_limit(&self) -> Option<usize> {
        if self.capabilities.contains(&Capability::SideBand64k) {
            Some(SIDE_BAND_64K_DATA)
        } else if self.capabilities.contains(&Capability::SideBand) {
            Some(SIDE_BAND_DATA)
        } else {
            None
        }
    }

    async fn prepare_pack(
        &self,
        wants: &[ObjectHash],
        common: &[ObjectHash],
    ) -> Result<ReceiverStream<Vec<u8>>, ProtocolError> {
        let tag_candidates = if self.capabilities.contains(&Capability::IncludeTag) {
            self.tag_candidates().await?
        } else {
            Vec::new()
        };
        let pack_generator = PackGenerator::new(&self.repo_storage);
        let entries = pack_generator
            .collect_objects(wants, common, &tag_candidates)
            .await?;
        tracing::info!(
            wants = wants.len(),
            common = common.len(),
            objects = entries.len(),
            "sending pack"
        );
        Ok(PackGenerator::<R>::generate_pack_stream(entries))
    }

    /// Annotated tag objects referenced from `refs/tags/`.
    async fn tag_candidates(&self) -> Result<Vec<ObjectHash>, ProtocolError> {
        let mut candidates = Vec::new();
        for reference in self.repo_storage.get_repository_refs().await? {
            if !reference.name.starts_with("refs/tags/") {
                continue;
            }
            let Some(hash) = reference.hash() else {
                continue;
            };
            match self.repo_storage.get_object(&hash).await {
                Ok(object) if object.obj_type == ObjectType::Tag => candidates.push(hash),
                Ok(_) | Err(ProtocolError::Storage(StorageError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(candidates)
    }

    /// Negotiation output followed by the pack, side-band framed and flush terminated when
    /// negotiated.
    fn pack_response(&self, prelude: BytesMut, pack: ReceiverStream<Vec<u8>>) -> ProtocolStream {
        let side_band = self.side_band_limit();
        let head = stream::iter(
            (!prelude.is_empty()).then(|| Ok::<Bytes, ProtocolError>(prelude.freeze())),
        );
        let body = pack.map(move |chunk| {
            Ok::<Bytes, ProtocolError>(match side_band {
                Some(max) => side_band_frames(SideBand::PackfileData, &chunk, max).freeze(),
                None => Bytes::from(chunk),
            })
        });
        let tail = stream::iter(
            side_band.map(|_| Ok::<Bytes, ProtocolError>(Bytes::from_static(&PKT_LINE_END_MARKER[..]))),
        );
        Box::pin(head.chain(body).chain(tail))
    }
}

fn once_stream(data: Bytes) -> ProtocolStream {
    Box::pin(stream::iter(
        (!data.is_empty()).then_some(Ok::<Bytes, ProtocolError>(data)),
    ))
}

fn add_pkt_line_bytes_on_band(out: &mut BytesMut, band: SideBand, data: &[u8]) {
    out.extend_from_slice(&side_band_frames(band, data, SIDE_BAND_DATA));
}

fn parse_hash(text: &str) -> Result<ObjectHash, ProtocolError> {
    ObjectHash::from_str(text).map_err(|e| ProtocolError::decode(format!("bad object id `{text}`: {e}")))
}

fn parse_negotiation_line(mut line: Bytes) -> Result<NegotiationLine, ProtocolError> {
    let command = read_until_white_space(&mut line);
    match command.as_str() {
        "have" => Ok(NegotiationLine::Have(parse_hash(&read_until_white_space(
            &mut line,
        ))?)),
        "done" => Ok(NegotiationLine::Done),
        _ => Ok(NegotiationLine::Other(command)),
    }
}

/// Reads a pack from `reader` up to its trailer. Truncated input is returned as is and
/// rejected later by the decoder.
async fn read_pack<Rd>(reader: &mut Rd) -> Result<Bytes, ProtocolError>
where
    Rd: AsyncRead + Unpin + Send,
{
    let mut scanner = PackScanner::new();
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; PACK_READ_CHUNK];
    loop {
        match scanner.feed(&buffer) {
            Ok(Some(end)) => {
                buffer.truncate(end);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "pack scan failed");
                break;
            }
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(buffer.freeze())
}

fn single_line(message: &str) -> String {
    message.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use futures::StreamExt;

    use super::*;
    use crate::{
        internal::{
            object::{
                blob::Blob,
                commit::Commit,
                signature::{Signature, SignatureType},
                tree::{Tree, TreeItem, TreeItemMode},
            },
            pack::{Pack, encode::encode_to_vec, entry::Entry},
        },
        protocol::{
            tests::{MemoryRepo, annotated_tag},
            types::ProtocolStream,
        },
        storage::{GitObject, Reference},
    };

    struct History {
        first: ObjectHash,
        second: ObjectHash,
        new_blob: ObjectHash,
    }

    fn commit(tree: &Tree, parents: Vec<ObjectHash>, msg: &str) -> Commit {
        Commit::new(
            Signature::new(SignatureType::Author, "tester", "tester@example.com"),
            Signature::new(SignatureType::Committer, "tester", "tester@example.com"),
            tree.id,
            parents,
            msg,
        )
    }

    /// `main` with two commits, `HEAD` pointing at it.
    fn seeded_repo() -> (MemoryRepo, History) {
        let repo = MemoryRepo::new();
        let readme = Blob::from_content("# demo\n");
        let extra = Blob::from_content("more\n");
        let tree1 = Tree::from_tree_items(vec![TreeItem::new(
            TreeItemMode::Blob,
            readme.id,
            "README.md".into(),
        )]);
        let tree2 = Tree::from_tree_items(vec![
            TreeItem::new(TreeItemMode::Blob, readme.id, "README.md".into()),
            TreeItem::new(TreeItemMode::Blob, extra.id, "extra.txt".into()),
        ]);
        let c1 = commit(&tree1, vec![], "first\n");
        let c2 = commit(&tree2, vec![c1.id], "second\n");
        let history = History {
            first: c1.id,
            second: c2.id,
            new_blob: extra.id,
        };
        for entry in [
            Entry::from(readme),
            Entry::from(extra),
            Entry::from(tree1),
            Entry::from(tree2),
            Entry::from(c1),
            Entry::from(c2),
        ] {
            repo.insert(entry);
        }
        repo.set_ref("refs/heads/main", history.second);
        repo.set_symbolic(HEAD, "refs/heads/main");
        (repo, history)
    }

    fn pkt(line: &str) -> String {
        format!("{:04x}{line}", line.len() + 4)
    }

    async fn collect(stream: ProtocolStream) -> Vec<u8> {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    /// Splits a response into its pkt-lines (as strings) and the raw tail after them.
    fn split_lines(mut data: Bytes, count: usize) -> (Vec<String>, Bytes) {
        let mut lines = Vec::new();
        for _ in 0..count {
            match read_pkt_line(&mut data).unwrap() {
                Some(PktLine::Data(line)) => lines.push(String::from_utf8_lossy(&line).to_string()),
                Some(PktLine::Flush) => lines.push("0000".to_string()),
                None => break,
            }
        }
        (lines, data)
    }

    /// Reassembles band-1 payloads from a side-band stream up to the closing flush.
    fn demux_band_one(mut data: Bytes) -> Vec<u8> {
        let mut pack = Vec::new();
        while let Some(line) = read_pkt_line(&mut data).unwrap() {
            match line {
                PktLine::Data(payload) => {
                    assert_eq!(payload[0], 1);
                    pack.extend_from_slice(&payload[1..]);
                }
                PktLine::Flush => break,
            }
        }
        pack
    }

    #[tokio::test]
    async fn test_info_refs_empty_repository() {
        let repo = MemoryRepo::new();
        let smart = SmartProtocol::new(TransportProtocol::Http, repo);
        let refs = smart.git_info_refs(Service::UploadPack).await.unwrap();
        let (lines, rest) = split_lines(refs.freeze(), 4);
        assert_eq!(lines[0], "# service=git-upload-pack\n");
        assert_eq!(lines[1], "0000");
        assert!(lines[2].starts_with(&format!(
            "{} capabilities^{{}}\0side-band side-band-64k",
            ObjectHash::zero_str()
        )));
        assert!(lines[2].contains("object-format=sha1"));
        assert_eq!(lines[3], "0000");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_info_refs_head_symref_and_peeled_tag() {
        let (repo, history) = seeded_repo();
        let tag = annotated_tag(history.first, "v1.0");
        repo.insert(tag.clone());
        repo.set_ref("refs/tags/v1.0", tag.hash);
        repo.set_ref("refs/tags/light", history.first);

        let smart = SmartProtocol::new(TransportProtocol::Ssh, repo);
        let refs = smart.git_info_refs(Service::ReceivePack).await.unwrap();
        let (lines, _) = split_lines(refs.freeze(), 6);
        assert!(lines[0].starts_with(&format!("{} HEAD\0report-status", history.second)));
        assert!(lines[0].ends_with(" symref=HEAD:refs/heads/main\n"));
        assert_eq!(lines[1], format!("{} refs/heads/main\n", history.second));
        assert_eq!(lines[2], format!("{} refs/tags/light\n", history.first));
        assert_eq!(lines[3], format!("{} refs/tags/v1.0\n", tag.hash));
        assert_eq!(lines[4], format!("{} refs/tags/v1.0^{{}}\n", history.first));
        assert_eq!(lines[5], "0000");
    }

    /// Refs without a resolvable HEAD: the first ref carries the capabilities.
    #[tokio::test]
    async fn test_info_refs_unborn_head() {
        let (repo, history) = seeded_repo();
        repo.set_symbolic(HEAD, "refs/heads/unborn");
        let smart = SmartProtocol::new(TransportProtocol::Ssh, repo);
        let refs = smart.git_info_refs(Service::UploadPack).await.unwrap();
        let (lines, _) = split_lines(refs.freeze(), 1);
        assert!(lines[0].starts_with(&format!("{} refs/heads/main\0", history.second)));
        assert!(!lines[0].contains("symref="));
    }

    #[tokio::test]
    async fn test_upload_pack_without_wants_is_empty() {
        let (repo, _) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);
        for body in [&b""[..], b"0000", b"0032want"] {
            let stream = smart
                .git_upload_pack(Bytes::copy_from_slice(body))
                .await
                .unwrap();
            assert!(collect(stream).await.is_empty(), "{body:?}");
        }
    }

    #[tokio::test]
    async fn test_upload_pack_unknown_want() {
        let (repo, _) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);
        let missing = ObjectHash::new(b"nothing");
        let body = format!("{}0000{}", pkt(&format!("want {missing}\n")), pkt("done\n"));
        let result = smart.git_upload_pack(Bytes::from(body)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_upload_pack_clone_without_side_band() {
        let (repo, history) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);
        let body = format!(
            "{}0000{}",
            pkt(&format!("want {} ofs-delta agent=git/2.45\n", history.second)),
            pkt("done\n")
        );
        let response = collect(smart.git_upload_pack(Bytes::from(body)).await.unwrap()).await;
        let (lines, pack) = split_lines(Bytes::from(response), 1);
        assert_eq!(lines, vec!["NAK\n".to_string()]);
        let decoded = Pack::decode(&pack).unwrap();
        assert_eq!(decoded.entries.len(), 6);
    }

    #[tokio::test]
    async fn test_upload_pack_incremental_with_side_band() {
        let (repo, history) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);
        let body = format!(
            "{}0000{}{}{}",
            pkt(&format!("want {} side-band-64k\n", history.second)),
            pkt(&format!("have {}\n", ObjectHash::new(b"client only"))),
            pkt(&format!("have {}\n", history.first)),
            pkt("done\n")
        );
        let response = collect(smart.git_upload_pack(Bytes::from(body)).await.unwrap()).await;
        let (lines, rest) = split_lines(Bytes::from(response), 1);
        assert_eq!(lines, vec![format!("ACK {}\n", history.first)]);
        let pack = demux_band_one(rest);
        let decoded = Pack::decode(&pack).unwrap();
        let ids: Vec<_> = decoded.entries.iter().map(|e| e.hash).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&history.second));
        assert!(ids.contains(&history.new_blob));
    }

    /// A stateless round ending in a flush gets only ACK/NAK lines.
    #[tokio::test]
    async fn test_upload_pack_negotiation_round() {
        let (repo, history) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);

        let unknown = format!(
            "{}0000{}0000",
            pkt(&format!("want {}\n", history.second)),
            pkt(&format!("have {}\n", ObjectHash::new(b"client only")))
        );
        let response = collect(smart.git_upload_pack(Bytes::from(unknown)).await.unwrap()).await;
        assert_eq!(response, pkt("NAK\n").into_bytes());

        let common = format!(
            "{}0000{}{}0000",
            pkt(&format!("want {}\n", history.second)),
            pkt(&format!("have {}\n", history.first)),
            pkt(&format!("have {}\n", history.second))
        );
        let response = collect(smart.git_upload_pack(Bytes::from(common)).await.unwrap()).await;
        assert_eq!(response, pkt(&format!("ACK {}\n", history.first)).into_bytes());
    }

    fn push_body(commands: &[String], pack: &[u8]) -> ProtocolStream {
        let mut body = BytesMut::new();
        for (i, command) in commands.iter().enumerate() {
            let line = if i == 0 {
                format!("{command}\0report-status agent=git/2.45\n")
            } else {
                format!("{command}\n")
            };
            add_pkt_line_string(&mut body, line);
        }
        add_flush(&mut body);
        body.extend_from_slice(pack);
        Box::pin(futures::stream::iter(vec![Ok::<Bytes, ProtocolError>(body.freeze())]))
    }

    /// Two refs in one push, one rejected: both statuses are reported.
    #[tokio::test]
    async fn test_receive_pack_status_isolation() {
        let (repo, history) = seeded_repo();
        let blob = Blob::from_content("pushed\n");
        let tree = Tree::from_tree_items(vec![TreeItem::new(
            TreeItemMode::Blob,
            blob.id,
            "pushed.txt".into(),
        )]);
        let pushed = commit(&tree, vec![history.second], "third\n");
        let pack = encode_to_vec(&[
            Entry::from(blob),
            Entry::from(tree),
            Entry::from(pushed.clone()),
        ])
        .unwrap();

        let zero = ObjectHash::zero_str();
        let commands = vec![
            format!("{zero} {} refs/heads/feature", pushed.id),
            format!("{} {} refs/heads/main", history.first, pushed.id),
        ];
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo.clone());
        let report = smart
            .git_receive_pack_stream(push_body(&commands, &pack))
            .await
            .unwrap();
        let expected = format!(
            "{}{}{}0000",
            pkt("unpack ok\n"),
            pkt("ok refs/heads/feature\n"),
            pkt("ng refs/heads/main stale old value\n")
        );
        assert_eq!(String::from_utf8_lossy(&report), expected);
        assert_eq!(repo.reference("refs/heads/feature"), Some(pushed.id));
        assert_eq!(repo.reference("refs/heads/main"), Some(history.second));
        assert_eq!(repo.hook_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_receive_pack_rejections() {
        let (repo, history) = seeded_repo();
        let zero = ObjectHash::zero_str();
        let missing = ObjectHash::new(b"not pushed");
        let commands = vec![
            format!("{} {zero} refs/heads/main", history.second),
            format!("{zero} {missing} refs/heads/ghost"),
            format!("{zero} {} bad..name", history.first),
            format!("{zero} {} HEAD", history.first),
        ];
        let empty_pack = encode_to_vec(&[]).unwrap();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo.clone());
        let report = smart
            .git_receive_pack_stream(push_body(&commands, &empty_pack))
            .await
            .unwrap();
        let report = String::from_utf8_lossy(&report).to_string();
        assert!(report.contains("ng refs/heads/ghost missing object\n"));
        assert!(report.contains("ng bad..name funny refname\n"));
        assert!(report.contains("ng HEAD funny refname\n"));
        // HEAD's target may be deleted, as in a bare git repository.
        assert!(report.contains("ok refs/heads/main\n"));
        assert_eq!(repo.reference("refs/heads/main"), None);
    }

    /// Delegates to a [`MemoryRepo`] but fails every lookup of one object.
    #[derive(Clone)]
    struct FailingLookup {
        inner: MemoryRepo,
        failing: ObjectHash,
    }

    #[async_trait::async_trait]
    impl RepositoryAccess for FailingLookup {
        async fn get_repository_refs(&self) -> Result<Vec<Reference>, ProtocolError> {
            self.inner.get_repository_refs().await
        }

        async fn resolve(&self, name: &str) -> Result<Option<ObjectHash>, ProtocolError> {
            self.inner.resolve(name).await
        }

        async fn has_object(&self, hash: &ObjectHash) -> Result<bool, ProtocolError> {
            if *hash == self.failing {
                return Err(StorageError::backend("transient S3 500").into());
            }
            self.inner.has_object(hash).await
        }

        async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, ProtocolError> {
            self.inner.get_object(hash).await
        }

        async fn put_object(
            &self,
            obj_type: ObjectType,
            data: &[u8],
        ) -> Result<ObjectHash, ProtocolError> {
            self.inner.put_object(obj_type, data).await
        }

        async fn update_reference(
            &self,
            name: &str,
            old: Option<ObjectHash>,
            new: Option<ObjectHash>,
        ) -> Result<(), ProtocolError> {
            self.inner.update_reference(name, old, new).await
        }
    }

    /// A storage error on one command is reported for that ref only; the push still
    /// finishes and the report still goes out.
    #[tokio::test]
    async fn test_receive_pack_storage_error_is_per_ref() {
        let (repo, history) = seeded_repo();
        let zero = ObjectHash::zero_str();
        let commands = vec![
            format!("{zero} {} refs/heads/a", history.first),
            format!("{zero} {} refs/heads/b", history.second),
        ];
        let empty_pack = encode_to_vec(&[]).unwrap();
        let flaky = FailingLookup {
            inner: repo.clone(),
            failing: history.second,
        };
        let mut smart = SmartProtocol::new(TransportProtocol::Http, flaky);
        let report = smart
            .git_receive_pack_stream(push_body(&commands, &empty_pack))
            .await
            .unwrap();
        let report = String::from_utf8_lossy(&report).to_string();
        assert!(report.contains("unpack ok\n"));
        assert!(report.contains("ok refs/heads/a\n"));
        let rejected = report
            .lines()
            .find(|line| line.contains("ng refs/heads/b "))
            .unwrap();
        assert!(rejected.contains("transient S3 500"));
        assert!(report.ends_with("0000"));
        assert_eq!(repo.reference("refs/heads/a"), Some(history.first));
        assert_eq!(repo.reference("refs/heads/b"), None);
    }

    #[tokio::test]
    async fn test_receive_pack_corrupt_pack() {
        let (repo, history) = seeded_repo();
        let zero = ObjectHash::zero_str();
        let commands = vec![format!("{zero} {} refs/heads/topic", history.first)];
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo.clone());
        let report = smart
            .git_receive_pack_stream(push_body(&commands, b"PACKgarbage"))
            .await
            .unwrap();
        let report = String::from_utf8_lossy(&report).to_string();
        assert_eq!(&report[4..11], "unpack ");
        assert!(!report.contains("unpack ok"));
        assert!(report.contains("ng refs/heads/topic unpacker error\n"));
        assert_eq!(repo.reference("refs/heads/topic"), None);
    }

    #[tokio::test]
    async fn test_receive_pack_malformed_command() {
        let (repo, _) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Http, repo);
        let result = smart
            .git_receive_pack_stream(push_body(&["not a command line".to_string()], b""))
            .await;
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn test_serve_upload_pack_stateful() {
        let (repo, history) = seeded_repo();
        let mut smart = SmartProtocol::new(TransportProtocol::Ssh, repo);
        let request = format!(
            "{}0000{}0000{}",
            pkt(&format!("want {} side-band-64k\n", history.second)),
            pkt(&format!("have {}\n", history.first)),
            pkt("done\n")
        );
        let mut reader = request.as_bytes();
        let mut output = Vec::new();
        smart.serve_upload_pack(&mut reader, &mut output).await.unwrap();

        let mut output = Bytes::from(output);
        // Advertisement: HEAD, main, flush.
        let (advert, _) = split_lines(output.clone(), 3);
        assert!(advert[0].contains(" HEAD\0"));
        assert_eq!(advert[2], "0000");
        for _ in 0..3 {
            read_pkt_line(&mut output).unwrap();
        }
        // The flush round acknowledges the common commit; done adds nothing.
        let (lines, rest) = split_lines(output, 1);
        assert_eq!(lines, vec![format!("ACK {}\n", history.first)]);
        let decoded = Pack::decode(&demux_band_one(rest)).unwrap();
        assert_eq!(decoded.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_serve_upload_pack_client_hangs_up() {
        let mut smart = SmartProtocol::new(TransportProtocol::Ssh, MemoryRepo::new());
        let mut reader: &[u8] = b"";
        let mut output = Vec::new();
        smart.serve_upload_pack(&mut reader, &mut output).await.unwrap();
        let (lines, rest) = split_lines(Bytes::from(output), 2);
        assert!(lines[0].contains("capabilities^{}"));
        assert_eq!(lines[1], "0000");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_serve_receive_pack_stops_at_pack_trailer() {
        let repo = MemoryRepo::new();
        let blob = Blob::from_content("hello\n");
        let tree = Tree::from_tree_items(vec![TreeItem::new(
            TreeItemMode::Blob,
            blob.id,
            "hello.txt".into(),
        )]);
        let root = commit(&tree, vec![], "root\n");
        let pack =
            encode_to_vec(&[Entry::from(blob), Entry::from(tree), Entry::from(root.clone())])
                .unwrap();

        let mut request = BytesMut::new();
        add_pkt_line_string(
            &mut request,
            format!(
                "{} {} refs/heads/main\0report-status side-band-64k\n",
                ObjectHash::zero_str(),
                root.id
            ),
        );
        add_flush(&mut request);
        request.extend_from_slice(&pack);
        let request = request.freeze();
        let mut reader = &request[..];
        let mut output = Vec::new();

        let mut smart = SmartProtocol::new(TransportProtocol::Ssh, repo.clone());
        smart.serve_receive_pack(&mut reader, &mut output).await.unwrap();
        assert_eq!(repo.reference("refs/heads/main"), Some(root.id));

        let mut output = Bytes::from(output);
        // Skip the empty-repository advertisement.
        for _ in 0..2 {
            read_pkt_line(&mut output).unwrap();
        }
        let report = demux_band_one(output);
        let expected = format!("{}{}0000", pkt("unpack ok\n"), pkt("ok refs/heads/main\n"));
        assert_eq!(String::from_utf8_lossy(&report), expected);
    }
}
