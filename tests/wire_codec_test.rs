use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use ponyfs::wire::{
   AddWatchArgs, Opcode, Parcel, ParcelCodec, ParcelType, PathArgs, ReadHeader, Request,
   RequestCodec,
};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Encoder, FramedRead, FramedWrite};

#[tokio::test]
async fn requests_cross_a_pipe_intact() {
   let (client, server) = tokio::io::duplex(256);
   let mut sink = FramedWrite::new(client, RequestCodec);
   let mut frames = FramedRead::new(server, RequestCodec);

   let requests = vec![
      Request::GetServerInfo,
      Request::Ls(PathArgs::new("/home/pony")),
      Request::AddWatch(AddWatchArgs {
         id:        3,
         path:      "/home/pony/src".into(),
         recursive: true,
         excludes:  vec!["/home/pony/src/target".into()],
      }),
   ];
   for request in &requests {
      sink.send(request).await.unwrap();
   }
   drop(sink);

   let mut decoded = Vec::new();
   while let Some(frame) = frames.next().await {
      decoded.push(frame.unwrap().into_request().unwrap());
   }
   assert_eq!(decoded, requests);
}

#[tokio::test]
async fn padded_server_info_frame_decodes() {
   let mut buf = BytesMut::new();
   RequestCodec.encode(Request::GetServerInfo, &mut buf).unwrap();
   // [2, {}] is three bytes, padded to sixteen
   assert_eq!(buf.len(), 17);
   assert_eq!(&buf[1..4], &[0x92, 0x02, 0x80]);
   assert!(buf[4..].iter().all(|&b| b == 0));

   let mut frames = FramedRead::new(&buf[..], RequestCodec);
   let frame = frames.next().await.unwrap().unwrap();
   assert_eq!(frame.opcode, Opcode::GetServerInfo);
   assert_eq!(frame.into_request().unwrap(), Request::GetServerInfo);
}

#[tokio::test]
async fn parcels_survive_byte_at_a_time_delivery() {
   let header = rmp_serde::to_vec_named(&ReadHeader { length: Some(5), hash_match: false }).unwrap();
   let parcels = vec![
      Parcel::new(ParcelType::Header, header),
      Parcel::new(ParcelType::Warning, &b"slow disk"[..]),
      Parcel::new(ParcelType::Body, &b"hel"[..]),
      Parcel::new(ParcelType::Body, &b"lo"[..]),
      Parcel::empty(ParcelType::EndOfBody),
   ];
   let mut encoded = BytesMut::new();
   for parcel in &parcels {
      ParcelCodec.encode(parcel.clone(), &mut encoded).unwrap();
   }

   let (mut writer, reader) = tokio::io::duplex(8);
   let feeder = tokio::spawn(async move {
      for byte in encoded {
         writer.write_all(&[byte]).await.unwrap();
      }
   });

   let decoded: Vec<Parcel> = FramedRead::new(reader, ParcelCodec)
      .map(|p| p.unwrap())
      .collect()
      .await;
   feeder.await.unwrap();
   assert_eq!(decoded, parcels);
   assert_eq!(decoded[2].body, Bytes::from_static(b"hel"));
}

#[tokio::test]
async fn garbage_type_byte_ends_the_stream_with_an_error() {
   let raw: &[u8] = &[0x01, 0x01, 0x80, 0x42, 0x00];
   let mut parcels = FramedRead::new(raw, ParcelCodec);
   assert_eq!(parcels.next().await.unwrap().unwrap().kind, ParcelType::Header);
   assert!(parcels.next().await.unwrap().is_err());
}
