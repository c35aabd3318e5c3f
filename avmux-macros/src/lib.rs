use darling::Error;
use darling::ast::NestedMeta;
use quote::quote;
use syn::{Data, DeriveInput, Fields, ItemStruct, parse_macro_input};

use proc_macro::TokenStream;

#[proc_macro_derive(ToBytes)]
pub fn derive_to_bytes(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields: Vec<syn::Member> = match input.data {
        Data::Struct(ref s) => match s.fields {
            Fields::Named(ref nf) => nf
                .named
                .iter()
                .filter_map(|f| f.ident.clone())
                .map(syn::Member::from)
                .collect(),
            Fields::Unnamed(ref uf) => uf
                .unnamed
                .iter()
                .enumerate()
                .map(|(i, _)| syn::Index::from(i).into())
                .collect(),
            Fields::Unit => Vec::new(),
        },
        _ => {
            return TokenStream::from(
                syn::Error::new_spanned(&name, "ToBytes can only be derived for structs")
                    .to_compile_error(),
            );
        }
    };

    let expanded = quote! {
        impl crate::utils::byteorder::WriteBytesBe for #name {
            fn write_be(&self, dst: &mut Vec<u8>) {
                #( crate::utils::byteorder::WriteBytesBe::write_be(&self.#fields, dst); )*
            }
        }

        impl crate::utils::byteorder::WriteBytesLe for #name {
            fn write_le(&self, dst: &mut Vec<u8>) {
                #( crate::utils::byteorder::WriteBytesLe::write_le(&self.#fields, dst); )*
            }
        }
    };

    TokenStream::from(expanded)
}

fn parse_four_cc(attr: TokenStream) -> Result<proc_macro2::TokenStream, TokenStream> {
    let args = match NestedMeta::parse_meta_list(attr.into()) {
        Ok(v) => v,
        Err(e) => {
            return Err(TokenStream::from(Error::from(e).write_errors()));
        }
    };

    let Some(first) = args.first() else {
        return Err(TokenStream::from(
            Error::custom("expected a byte string, e.g. b\"mvhd\"").write_errors(),
        ));
    };

    let type_bytes = match first {
        NestedMeta::Lit(syn::Lit::ByteStr(bs)) => bs.value(),
        _ => {
            return Err(TokenStream::from(
                syn::Error::new_spanned(first, "expected a byte string, e.g. b\"mvhd\"")
                    .to_compile_error(),
            ));
        }
    };

    if type_bytes.len() != 4 {
        return Err(TokenStream::from(
            syn::Error::new_spanned(first, "four character code expects 4 bytes")
                .to_compile_error(),
        ));
    }

    Ok(quote! {[#(#type_bytes),*]})
}

/// Implements `BoxBody` (big-endian body) for an ISOBMFF box struct.
#[proc_macro_attribute]
pub fn box_type(attr: TokenStream, item: TokenStream) -> TokenStream {
    let type_bytes_tokens = match parse_four_cc(attr) {
        Ok(tokens) => tokens,
        Err(err) => return err,
    };

    let input = parse_macro_input!(item as ItemStruct);
    let name = &input.ident;

    let expanded = quote! {
        #input

        impl BoxBody for #name {
            fn box_type(&self) -> &[u8; 4] {
                const BYTES: [u8; 4] = #type_bytes_tokens;
                &BYTES
            }

            fn box_data(&self) -> Vec<u8> {
                let mut vec = Vec::new();
                self.write_be(&mut vec);
                vec
            }
        }
    };
    TokenStream::from(expanded)
}

/// Implements `RiffChunk` (little-endian body) for a RIFF chunk struct.
#[proc_macro_attribute]
pub fn riff_chunk(attr: TokenStream, item: TokenStream) -> TokenStream {
    let type_bytes_tokens = match parse_four_cc(attr) {
        Ok(tokens) => tokens,
        Err(err) => return err,
    };

    let input = parse_macro_input!(item as ItemStruct);
    let name = &input.ident;

    let expanded = quote! {
        #input

        impl RiffChunk for #name {
            fn chunk_id(&self) -> &[u8; 4] {
                const BYTES: [u8; 4] = #type_bytes_tokens;
                &BYTES
            }

            fn chunk_data(&self) -> Vec<u8> {
                let mut vec = Vec::new();
                self.write_le(&mut vec);
                vec
            }
        }
    };
    TokenStream::from(expanded)
}
